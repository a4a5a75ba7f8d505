//! Job runner ports.

use crate::core::{BuildResult, Progress};
use crate::errors::RunnerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Snapshot of a job as seen by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Result of the latest build, `Unknown` while it is still active.
    pub result: BuildResult,
    /// Whether any build of the job is running or queued.
    pub progress: Progress,
    /// Number of the latest build, if the job was ever built.
    pub last_build_number: Option<u64>,
}

impl JobStatus {
    /// Creates a status for a job that was never built.
    #[must_use]
    pub fn never_built() -> Self {
        Self {
            result: BuildResult::Unknown,
            progress: Progress::Idle,
            last_build_number: None,
        }
    }
}

/// Everything the runner needs to start one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Token for security-enabled runners.
    pub security_token: Option<String>,
    /// Build parameters.
    pub params: BTreeMap<String, String>,
    /// Why the build was started.
    pub cause: Option<String>,
    /// Description to attach to the build.
    pub description: Option<String>,
}

/// The CI job runner.
///
/// `poll` refreshes everything, `quick_poll` only what is needed to follow
/// active builds and `queue_poll` only the build queue. Implementations may
/// make the cheaper variants no-ops.
pub trait JobRunnerPort: Send + Sync {
    /// Refreshes the runner state.
    fn poll(&self) -> Result<(), RunnerError>;

    /// Refreshes the state of active builds.
    fn quick_poll(&self) -> Result<(), RunnerError>;

    /// Refreshes the build queue.
    fn queue_poll(&self) -> Result<(), RunnerError>;

    /// Looks up a job by its full name.
    ///
    /// Fails with [`RunnerError::UnknownJob`] when the job does not exist.
    fn get_job(&self, name: &str) -> Result<Arc<dyn JobHandle>, RunnerError>;

    /// Creates a job from a runner-specific definition.
    fn create_job(&self, name: &str, definition: &str) -> Result<(), RunnerError>;

    /// Deletes a job.
    fn delete_job(&self, name: &str) -> Result<(), RunnerError>;
}

/// A job known to the runner.
pub trait JobHandle: Send + Sync {
    /// Full job name.
    fn name(&self) -> &str;

    /// URL of the job, for reports and the flow graph.
    fn public_url(&self) -> String;

    /// Current result/progress/build number of the job.
    fn job_status(&self) -> Result<JobStatus, RunnerError>;

    /// Starts a build.
    fn invoke(&self, request: InvokeRequest) -> Result<Arc<dyn InvocationHandle>, RunnerError>;

    /// Refreshes the job state.
    fn poll(&self) -> Result<(), RunnerError>;

    /// Stops every running build and dequeues every queued build of the job,
    /// no matter who started them.
    fn stop_all(&self) -> Result<(), RunnerError>;
}

/// One build started through [`JobHandle::invoke`].
pub trait InvocationHandle: Send + Sync {
    /// Result and progress of the build.
    fn status(&self) -> Result<(BuildResult, Progress), RunnerError>;

    /// Stops the build. With `dequeue` a queued build is removed from the
    /// queue; without it only a running build is stopped.
    fn stop(&self, dequeue: bool) -> Result<(), RunnerError>;

    /// Console URL of the build, once it has a build number.
    fn console_url(&self) -> Option<String>;

    /// Sets or appends to the build description.
    fn set_description(&self, description: &str, replace: bool, separator: &str) -> Result<(), RunnerError>;
}
