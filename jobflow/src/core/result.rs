//! Build results and their aggregation order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a build, a job or a whole group.
///
/// Variants are declared in aggregation order. A group's result is the
/// minimum over its children, so `Failure` always wins and `Unknown` loses
/// to everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    /// The build failed.
    Failure,
    /// The build was aborted.
    Aborted,
    /// The build completed with test failures or warnings.
    Unstable,
    /// The build succeeded.
    Success,
    /// A later invocation of the same job replaced this queued one.
    Superseded,
    /// The invocation was removed from the queue before it started.
    Dequeued,
    /// No result yet.
    #[default]
    Unknown,
}

impl BuildResult {
    /// Returns the upper-case name used in reports and graph exports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
            Self::Unstable => "UNSTABLE",
            Self::Success => "SUCCESS",
            Self::Superseded => "SUPERSEDED",
            Self::Dequeued => "DEQUEUED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns true for the results that make a flow fail.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::Aborted)
    }

    /// Returns the worst result, or `Unknown` for an empty iterator.
    pub fn worst<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        results.into_iter().fold(Self::Unknown, Self::min)
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order() {
        let ordered = [
            BuildResult::Failure,
            BuildResult::Aborted,
            BuildResult::Unstable,
            BuildResult::Success,
            BuildResult::Superseded,
            BuildResult::Dequeued,
            BuildResult::Unknown,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_worst_takes_minimum() {
        assert_eq!(
            BuildResult::worst([BuildResult::Success, BuildResult::Unstable, BuildResult::Superseded]),
            BuildResult::Unstable
        );
        assert_eq!(
            BuildResult::worst([BuildResult::Unstable, BuildResult::Aborted]),
            BuildResult::Aborted
        );
        assert_eq!(BuildResult::worst([]), BuildResult::Unknown);
    }

    #[test]
    fn test_failure_set() {
        assert!(BuildResult::Failure.is_failure());
        assert!(BuildResult::Aborted.is_failure());
        assert!(!BuildResult::Unstable.is_failure());
        assert!(!BuildResult::Dequeued.is_failure());
    }

    #[test]
    fn test_serialize_names() {
        assert_eq!(serde_json::to_string(&BuildResult::Superseded).unwrap(), r#""SUPERSEDED""#);
        assert_eq!(BuildResult::Dequeued.to_string(), "DEQUEUED");
    }
}
