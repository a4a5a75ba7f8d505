//! Propagation, checking, progress and kill enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a node's raw result is reported to its parent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Failures propagate as failures.
    #[default]
    Normal,
    /// Failures propagate as unstable.
    FailureToUnstable,
    /// The node never fails or blocks its parent.
    Unchecked,
}

impl Propagation {
    /// Returns the upper-case name used in reports and graph exports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::FailureToUnstable => "FAILURE_TO_UNSTABLE",
            Self::Unchecked => "UNCHECKED",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-node checking state, ordered so that the minimum across children is
/// the state of the enclosing group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Checking {
    /// The node still has checked work running.
    #[default]
    MustCheck,
    /// Only unchecked work remains.
    HasUnchecked,
    /// Nothing left to observe.
    Finished,
}

impl Checking {
    /// Returns the upper-case name used in reports and graph exports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MustCheck => "MUST_CHECK",
            Self::HasUnchecked => "HAS_UNCHECKED",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for Checking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of a job or build as reported by the job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Progress {
    /// Executing.
    Running,
    /// Waiting in the runner's queue.
    Queued,
    /// Nothing running or queued.
    Idle,
}

impl Progress {
    /// Returns the upper-case name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Queued => "QUEUED",
            Self::Idle => "IDLE",
        }
    }

    /// Returns true when the job has nothing running or queued.
    #[must_use]
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested cancellation scope.
///
/// Ordered so that a stronger request (`All`) is never downgraded by a later,
/// weaker one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillType {
    /// No kill requested.
    #[default]
    None,
    /// Stop builds started by this run.
    Current,
    /// Stop every running build of every job in the flow.
    All,
}

impl KillType {
    /// Returns true for `Current` and `All`.
    #[must_use]
    pub fn is_requested(self) -> bool {
        self != Self::None
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Current => 1,
            Self::All => 2,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Current,
            _ => Self::All,
        }
    }
}

impl fmt::Display for KillType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Current => write!(f, "CURRENT"),
            Self::All => write!(f, "ALL"),
        }
    }
}
