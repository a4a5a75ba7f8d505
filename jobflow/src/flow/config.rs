//! Controller and group configuration.

use crate::core::Propagation;
use crate::errors::FlowError;
use crate::utils::params::DEFAULT_SECRET_PARAMS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the graph file written into `json_dir`.
pub const GRAPH_FILE_NAME: &str = "flow_graph.json";

/// Configuration of a whole flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between polls of unfinished jobs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// Seconds between status reports of polled jobs.
    #[serde(default = "default_report_interval")]
    pub report_interval_seconds: f64,
    /// Fail if a job is running or queued when the flow starts.
    #[serde(default = "default_true")]
    pub require_idle: bool,
    /// Tolerate jobs missing at start; they must exist when reached.
    #[serde(default)]
    pub allow_missing_jobs: bool,
    /// Directory for the flow graph file. No graph is written when unset.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
    /// Pretty-print the graph with this indentation, keyed by job names.
    #[serde(default)]
    pub json_indent: Option<usize>,
    /// Strip the top-level job name prefix from graph node names.
    #[serde(default = "default_true")]
    pub json_strip_top_level_prefix: bool,
    /// Fail the run when the final result is not `SUCCESS`.
    #[serde(default = "default_true")]
    pub raise_if_unsuccessful: bool,
    /// Stop every build of every job in the flow instead of running it.
    #[serde(default)]
    pub kill_all: bool,
    /// Only export the graph; invoke nothing.
    #[serde(default)]
    pub just_dump: bool,
    /// Token for security-enabled runners.
    #[serde(default)]
    pub security_token: Option<String>,
    /// Cause sent with every invocation. Derived from the environment when unset.
    #[serde(default)]
    pub cause: Option<String>,
    /// Description attached to every invocation.
    #[serde(default)]
    pub description: Option<String>,
    /// Parameter display order, `[first..., "*", last...]`.
    #[serde(default)]
    pub params_display_order: Vec<String>,
    /// Regex of parameter names whose values are masked.
    #[serde(default = "default_secret_params")]
    pub secret_params: String,
    /// Install a SIGTERM listener that kills the builds of this run.
    #[serde(default = "default_true")]
    pub handle_sigterm: bool,
}

fn default_poll_interval() -> f64 {
    0.5
}

fn default_report_interval() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_secret_params() -> String {
    DEFAULT_SECRET_PARAMS.to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            report_interval_seconds: default_report_interval(),
            require_idle: true,
            allow_missing_jobs: false,
            json_dir: None,
            json_indent: None,
            json_strip_top_level_prefix: true,
            raise_if_unsuccessful: true,
            kill_all: false,
            just_dump: false,
            security_token: None,
            cause: None,
            description: None,
            params_display_order: Vec::new(),
            secret_params: default_secret_params(),
            handle_sigterm: true,
        }
    }
}

impl ControllerConfig {
    /// Creates a new controller configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks intervals and the secret parameter pattern.
    pub fn validate(&self) -> Result<(), FlowError> {
        if !(self.poll_interval_seconds > 0.0) {
            return Err(FlowError::Config(format!(
                "poll_interval_seconds must be positive, got {}",
                self.poll_interval_seconds
            )));
        }
        if !(self.report_interval_seconds > 0.0) {
            return Err(FlowError::Config(format!(
                "report_interval_seconds must be positive, got {}",
                self.report_interval_seconds
            )));
        }
        regex::Regex::new(&self.secret_params)?;
        Ok(())
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, seconds: f64) -> Self {
        self.poll_interval_seconds = seconds;
        self
    }

    /// Sets the report interval.
    #[must_use]
    pub fn with_report_interval(mut self, seconds: f64) -> Self {
        self.report_interval_seconds = seconds;
        self
    }

    /// Sets whether jobs must be idle at start.
    #[must_use]
    pub fn with_require_idle(mut self, require_idle: bool) -> Self {
        self.require_idle = require_idle;
        self
    }

    /// Sets whether missing jobs are tolerated at start.
    #[must_use]
    pub fn with_allow_missing_jobs(mut self, allow: bool) -> Self {
        self.allow_missing_jobs = allow;
        self
    }

    /// Sets the graph output directory.
    #[must_use]
    pub fn with_json_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.json_dir = Some(dir.into());
        self
    }

    /// Sets the graph indentation.
    #[must_use]
    pub fn with_json_indent(mut self, indent: usize) -> Self {
        self.json_indent = Some(indent);
        self
    }

    /// Sets whether the top-level prefix is stripped in the graph.
    #[must_use]
    pub fn with_json_strip_top_level_prefix(mut self, strip: bool) -> Self {
        self.json_strip_top_level_prefix = strip;
        self
    }

    /// Sets whether an unsuccessful run is an error.
    #[must_use]
    pub fn with_raise_if_unsuccessful(mut self, raise: bool) -> Self {
        self.raise_if_unsuccessful = raise;
        self
    }

    /// Turns the run into a kill-all run.
    #[must_use]
    pub fn with_kill_all(mut self, kill_all: bool) -> Self {
        self.kill_all = kill_all;
        self
    }

    /// Sets just-dump mode.
    #[must_use]
    pub fn with_just_dump(mut self, just_dump: bool) -> Self {
        self.just_dump = just_dump;
        self
    }

    /// Sets the security token.
    #[must_use]
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }

    /// Sets the invocation cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Sets the invocation description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the parameter display order.
    #[must_use]
    pub fn with_params_display_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params_display_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the secret parameter pattern.
    #[must_use]
    pub fn with_secret_params(mut self, pattern: impl Into<String>) -> Self {
        self.secret_params = pattern.into();
        self
    }

    /// Sets whether a SIGTERM listener is installed.
    #[must_use]
    pub fn with_handle_sigterm(mut self, handle: bool) -> Self {
        self.handle_sigterm = handle;
        self
    }

    /// Gets the poll interval as Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    /// Sleep between sweeps: the smaller of the poll and report intervals.
    #[must_use]
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds.min(self.report_interval_seconds))
    }

    /// The cause sent with invocations.
    ///
    /// Without an explicit cause this is derived from `JOB_NAME`/`BUILD_NUMBER`
    /// when running inside a CI job, else from the current user.
    #[must_use]
    pub fn resolved_cause(&self) -> String {
        if let Some(cause) = &self.cause {
            return cause.clone();
        }
        if let Ok(job_name) = std::env::var("JOB_NAME") {
            let build_number = std::env::var("BUILD_NUMBER").unwrap_or_else(|_| "None".to_string());
            return format!("By flow job '{job_name}' #{build_number}");
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        format!("By flow script, user '{user}'")
    }
}

/// Options for one serial or parallel group.
///
/// Unset options are inherited from the enclosing group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOptions {
    /// Seconds the group may run; `0` is unbounded.
    #[serde(default)]
    pub timeout_seconds: f64,
    /// Security token for invocations in this group.
    #[serde(default)]
    pub security_token: Option<String>,
    /// Appended to the parent's job name prefix.
    #[serde(default)]
    pub job_name_prefix: String,
    /// Number of times the group may be invoked.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Propagation of the group and its invocations.
    #[serde(default)]
    pub propagation: Option<Propagation>,
    /// Seconds between status reports.
    #[serde(default)]
    pub report_interval_seconds: Option<f64>,
    /// Regex of parameter names whose values are masked.
    #[serde(default)]
    pub secret_params: Option<String>,
    /// Tolerate jobs missing at start.
    #[serde(default)]
    pub allow_missing_jobs: Option<bool>,
}

fn default_max_tries() -> u32 {
    1
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 0.0,
            security_token: None,
            job_name_prefix: String::new(),
            max_tries: default_max_tries(),
            propagation: None,
            report_interval_seconds: None,
            secret_params: None,
            allow_missing_jobs: None,
        }
    }
}

impl GroupOptions {
    /// Creates group options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the security token.
    #[must_use]
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }

    /// Sets the job name prefix.
    #[must_use]
    pub fn with_job_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_name_prefix = prefix.into();
        self
    }

    /// Sets the maximum number of tries.
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Sets the propagation.
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = Some(propagation);
        self
    }

    /// Sets the report interval.
    #[must_use]
    pub fn with_report_interval(mut self, seconds: f64) -> Self {
        self.report_interval_seconds = Some(seconds);
        self
    }

    /// Sets the secret parameter pattern.
    #[must_use]
    pub fn with_secret_params(mut self, pattern: impl Into<String>) -> Self {
        self.secret_params = Some(pattern.into());
        self
    }

    /// Sets whether missing jobs are tolerated at start.
    #[must_use]
    pub fn with_allow_missing_jobs(mut self, allow: bool) -> Self {
        self.allow_missing_jobs = Some(allow);
        self
    }
}
