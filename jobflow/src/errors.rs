//! Error types for jobflow.
//!
//! Errors fall in two families. [`JobFailure`] is the retryable family: a
//! composite that receives one from a child decides whether to retry the
//! child or to report its own failure upward. Every other [`FlowError`]
//! variant is fatal for the run.

use crate::core::{BuildResult, Progress, Propagation};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for jobflow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The builder was used outside of the scope it was declared in.
    #[error("{0}")]
    Scope(#[from] FlowScopeError),

    /// A job was already running or queued when the flow started.
    #[error("{0}")]
    JobNotIdle(#[from] JobNotIdleError),

    /// A node's message was set twice.
    #[error("{0}")]
    MessageRedefined(#[from] MessageRedefinedError),

    /// A job or child group failed; the parent may retry.
    #[error("{0}")]
    Retryable(#[from] JobFailure),

    /// A group ran longer than its timeout.
    #[error("{0}")]
    Timeout(#[from] FlowTimeoutError),

    /// The flow finished with a result other than success.
    #[error("Flow Unsuccessful: {result}")]
    FinalResult {
        /// The aggregate result of the root group.
        result: BuildResult,
    },

    /// A kill request interrupted a sweep.
    #[error("Flow killed: {0}")]
    Killed(String),

    /// The job runner reported an error.
    #[error("{0}")]
    Runner(#[from] RunnerError),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Returns true for the retryable failure family.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Returns the propagation of the node that raised the error.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        match self {
            Self::Retryable(failure) => failure.propagation(),
            Self::Timeout(timeout) => timeout.propagation,
            _ => Propagation::Normal,
        }
    }

    /// Returns the retryable failure, if this is one.
    #[must_use]
    pub fn as_failure(&self) -> Option<&JobFailure> {
        match self {
            Self::Retryable(failure) => Some(failure),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::Scope(_) => "scope",
            Self::JobNotIdle(_) => "job_not_idle",
            Self::MessageRedefined(_) => "message_redefined",
            Self::Retryable(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::FinalResult { .. } => "final_result",
            Self::Killed(_) => "killed",
            Self::Runner(_) => "runner",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        };
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::Value::String(kind.to_string()));
        map.insert("message".to_string(), serde_json::Value::String(self.to_string()));
        map.insert(
            "propagation".to_string(),
            serde_json::Value::String(self.propagation().name().to_string()),
        );
        map.insert("retryable".to_string(), serde_json::Value::Bool(self.is_retryable()));
        if let Self::Retryable(failure) = self {
            map.insert("aborted".to_string(), serde_json::Value::Bool(failure.is_aborted()));
        }
        if let Self::FinalResult { result } = self {
            map.insert("result".to_string(), serde_json::Value::String(result.name().to_string()));
        }
        map
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<regex::Error> for FlowError {
    fn from(err: regex::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Error raised when the builder is used out of scope.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FlowScopeError {
    /// The error message.
    pub message: String,
    /// Nesting level the node would have had.
    pub nesting_level: i32,
    /// Nesting level currently open in the builder.
    pub current_nesting_level: i32,
}

impl FlowScopeError {
    /// Creates a new scope error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nesting_level: 0,
            current_nesting_level: 0,
        }
    }

    /// Sets the offending and current nesting levels.
    #[must_use]
    pub fn with_levels(mut self, nesting_level: i32, current_nesting_level: i32) -> Self {
        self.nesting_level = nesting_level;
        self.current_nesting_level = current_nesting_level;
        self
    }
}

/// Error raised when a job is busy at flow start.
#[derive(Debug, Clone, Error)]
#[error("job: '{job}' is in state {progress}. It must be IDLE.")]
pub struct JobNotIdleError {
    /// The job name.
    pub job: String,
    /// The observed progress.
    pub progress: Progress,
}

/// Error raised when a node message is set twice.
#[derive(Debug, Clone, Error)]
#[error("Existing message: '{existing}', new message: '{new}'")]
pub struct MessageRedefinedError {
    /// The message already set.
    pub existing: String,
    /// The rejected message.
    pub new: String,
}

/// Error raised when a group exceeds its timeout.
#[derive(Debug, Clone, Error)]
#[error("Timeout {elapsed}, in flow {flow}. Unfinished jobs: {unfinished:?}")]
pub struct FlowTimeoutError {
    /// Sequence of the timed-out group.
    pub flow: String,
    /// Elapsed time message.
    pub elapsed: String,
    /// Children still being checked.
    pub unfinished: Vec<String>,
    /// Propagation of the timed-out group.
    pub propagation: Propagation,
}

/// The retryable failure family.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    /// A single job finished with a failing result.
    #[error("Failed job: '{job}', result: {result}, propagation: {propagation}.")]
    SingleJob {
        /// The job name.
        job: String,
        /// The failing result.
        result: BuildResult,
        /// Propagation of the invocation.
        propagation: Propagation,
    },

    /// A serial group stopped on a failing child.
    #[error("Failed child job in: {flow}, child job: {child}, propagation: {propagation}.")]
    ChildJob {
        /// Sequence of the failing group.
        flow: String,
        /// Sequence of the failing child.
        child: String,
        /// Propagation of the group.
        propagation: Propagation,
        /// Whether an aborted build caused the failure.
        aborted: bool,
    },

    /// A parallel group finished with failing children.
    #[error("Failed child jobs in: {flow}, child jobs: {children:?}, propagation: {propagation}.")]
    ChildJobs {
        /// Sequence of the failing group.
        flow: String,
        /// Sequences of the failed children.
        children: Vec<String>,
        /// Propagation of the group.
        propagation: Propagation,
        /// Whether an aborted build caused the failure.
        aborted: bool,
    },

    /// A referenced job does not exist on the runner.
    #[error("Missing job: '{name}'")]
    MissingJob {
        /// The job name.
        name: String,
    },
}

impl JobFailure {
    /// Returns the propagation carried by the failure.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        match self {
            Self::SingleJob { propagation, .. }
            | Self::ChildJob { propagation, .. }
            | Self::ChildJobs { propagation, .. } => *propagation,
            Self::MissingJob { .. } => Propagation::Normal,
        }
    }

    /// Returns true when an aborted build caused the failure.
    ///
    /// Aborted failures are never retried at any level.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        match self {
            Self::SingleJob { result, .. } => *result == BuildResult::Aborted,
            Self::ChildJob { aborted, .. } | Self::ChildJobs { aborted, .. } => *aborted,
            Self::MissingJob { .. } => false,
        }
    }

    /// Returns the failed child sequences of a parallel group failure.
    #[must_use]
    pub fn failed_children(&self) -> &[String] {
        match self {
            Self::ChildJobs { children, .. } => children,
            _ => &[],
        }
    }
}

/// Errors reported by a job runner.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// The job does not exist.
    #[error("Unknown job: '{name}'")]
    UnknownJob {
        /// The job name.
        name: String,
    },

    /// A request to the runner failed.
    #[error("Job runner request failed: {0}")]
    Request(String),
}

impl RunnerError {
    /// Returns true when the runner does not know the job.
    #[must_use]
    pub fn is_unknown_job(&self) -> bool {
        matches!(self, Self::UnknownJob { .. })
    }
}
