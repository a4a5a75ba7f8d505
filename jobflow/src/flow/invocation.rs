//! The leaf node: one invocation of one job.

use super::context::SweepContext;
use super::node::NodeState;
use crate::core::{BuildResult, Checking, KillType, Progress, Propagation};
use crate::errors::{FlowError, JobFailure, JobNotIdleError};
use crate::runner::{InvocationHandle, InvokeRequest, JobHandle};
use crate::utils::{display_order, mask_secrets, JobParams};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One job invocation in the flow.
///
/// Invocations of the same job name share the runner's job handle. A later
/// invocation of a job supersedes an earlier one that is still queued.
pub struct Invocation {
    pub(crate) state: NodeState,
    pub(crate) name: String,
    pub(crate) params: JobParams,
    pub(crate) security_token: Option<String>,
    pub(crate) allow_missing_jobs: bool,
    pub(crate) secret_params: Regex,
    /// 1-based count among invocations of the same job name.
    pub(crate) invocation_number: usize,
    pub(crate) job: Option<Arc<dyn JobHandle>>,
    pub(crate) invocation: Option<Arc<dyn InvocationHandle>>,
    pub(crate) old_build_number: Option<u64>,
    /// Set once a stop was sent in the current kill.
    pub(crate) stop_sent: bool,
}

impl Invocation {
    /// Full job name, including prefixes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters sent with the invocation.
    #[must_use]
    pub fn params(&self) -> &JobParams {
        &self.params
    }

    /// Shared bookkeeping of the node.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// 1-based count among invocations of the same job name in the flow.
    #[must_use]
    pub fn invocation_number(&self) -> usize {
        self.invocation_number
    }

    /// URL of the job once it was resolved.
    #[must_use]
    pub fn job_url(&self) -> Option<String> {
        self.job.as_ref().map(|job| job.public_url())
    }

    /// Console URL of the latest build started by this node.
    #[must_use]
    pub fn console_url(&self) -> Option<String> {
        self.invocation.as_ref().and_then(|invocation| invocation.console_url())
    }

    /// Parameters with secret values masked.
    #[must_use]
    pub fn display_params(&self) -> JobParams {
        mask_secrets(&self.params, &self.secret_params)
    }

    pub(crate) fn sequence(&self) -> String {
        self.name.clone()
    }

    fn is_unchecked(&self) -> bool {
        self.state.propagation == Propagation::Unchecked
    }

    fn repr(&self) -> String {
        let unchecked = if self.is_unchecked() { "unchecked " } else { "" };
        format!("{unchecked}job: '{}'", self.name)
    }

    fn status_message(&self, progress: Progress, build_number: Option<u64>) -> String {
        let build = build_number.map_or_else(|| "None".to_string(), |n| n.to_string());
        format!("{} Status {progress} - latest build: #{build}", self.repr())
    }

    /// Resolves the job and starts the first attempt.
    pub(crate) fn prepare_first(&mut self, ctx: &mut SweepContext<'_>) -> Result<(), FlowError> {
        let job = match ctx.registry.resolve(ctx.runner, &self.name) {
            Ok(job) => job,
            Err(err) if err.is_unknown_job() => {
                if !(self.allow_missing_jobs || ctx.kill_mode) {
                    return Err(self.missing_job());
                }
                info!(job = %self.name, "{}{} - MISSING JOB", self.state.indentation(), self.repr());
                self.state.prepare_to_invoke(false);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.state.prepare_to_invoke(false);
        let status = self.attach(job)?;
        if ctx.settings.require_idle && !ctx.kill_mode && !status.progress.is_idle() {
            return Err(JobNotIdleError {
                job: self.name.clone(),
                progress: status.progress,
            }
            .into());
        }

        info!(
            job = %self.name,
            "{}{}",
            self.state.indentation(),
            self.status_message(status.progress, status.last_build_number)
        );
        Ok(())
    }

    fn attach(&mut self, job: Arc<dyn JobHandle>) -> Result<crate::runner::JobStatus, FlowError> {
        job.poll()?;
        let status = job.job_status()?;
        self.old_build_number = status.last_build_number;
        self.job = Some(job);
        Ok(status)
    }

    fn missing_job(&mut self) -> FlowError {
        self.state.checking_status = Checking::Finished;
        self.state.result = BuildResult::Failure;
        JobFailure::MissingJob {
            name: self.name.clone(),
        }
        .into()
    }

    /// Resolves a job that was missing at start; it must exist by now.
    fn resolve_required(&mut self, ctx: &mut SweepContext<'_>) -> Result<Arc<dyn JobHandle>, FlowError> {
        match ctx.registry.resolve(ctx.runner, &self.name) {
            Ok(job) => {
                self.attach(Arc::clone(&job))?;
                Ok(job)
            }
            Err(err) if err.is_unknown_job() => Err(self.missing_job()),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn prepare_to_invoke(&mut self, reset_tried_times: bool) {
        self.state.prepare_to_invoke(reset_tried_times);
        self.stop_sent = false;
    }

    pub(crate) fn check(&mut self, ctx: &mut SweepContext<'_>, report_now: bool) -> Result<(), FlowError> {
        let job = match self.job.clone() {
            Some(job) => job,
            None => self.resolve_required(ctx)?,
        };

        if !self.state.is_invoked() {
            ctx.kill.checkpoint()?;
            self.state.must_invoke_set_invocation_time(ctx.now);
            self.invoke(ctx, &job)?;
        }

        job.poll()?;
        let (result, progress) = self.observe(&job)?;
        if !progress.is_idle() || result == BuildResult::Unknown {
            if report_now {
                info!(job = %self.name, progress = %progress, "{}", self.status_message(progress, self.old_build_number));
            }
            return Ok(());
        }

        self.state.checking_status = Checking::Finished;
        self.state.result = result;
        let unchecked = if self.is_unchecked() { "UNCHECKED " } else { "" };
        info!(job = %self.name, "{} stopped running", self.repr());
        info!(
            job = %self.name,
            result = %result,
            "{unchecked}{result}: '{}' - build: {} {}",
            self.name,
            self.console_url().unwrap_or_default(),
            self.state.time_msg(ctx.now, ctx.start_time)
        );

        if result.is_failure() {
            return Err(JobFailure::SingleJob {
                job: self.name.clone(),
                result,
                propagation: self.state.propagation,
            }
            .into());
        }
        Ok(())
    }

    fn invoke(&mut self, ctx: &SweepContext<'_>, job: &Arc<dyn JobHandle>) -> Result<(), FlowError> {
        // Unchecked jobs left running by an earlier attempt are followed, not restarted
        if self.is_unchecked() && !job.job_status()?.progress.is_idle() {
            debug!(job = %self.name, "Unchecked job still running, not invoking again");
            return Ok(());
        }

        self.state.invocation_message("Job", &self.repr());
        let request = InvokeRequest {
            security_token: self.security_token.clone(),
            params: self.params.clone(),
            cause: Some(ctx.settings.cause.clone()),
            description: ctx.settings.description.clone(),
        };
        let invocation = job.invoke(request)?;
        if let Some(url) = invocation.console_url() {
            debug!(job = %self.name, console_url = %url, "Invoked");
        }
        self.invocation = Some(invocation);
        Ok(())
    }

    /// Result and progress of the build this node follows.
    fn observe(&self, job: &Arc<dyn JobHandle>) -> Result<(BuildResult, Progress), FlowError> {
        if let Some(invocation) = &self.invocation {
            return Ok(invocation.status()?);
        }
        let status = job.job_status()?;
        Ok((status.result, status.progress))
    }

    pub(crate) fn kill_check(&mut self, ctx: &mut SweepContext<'_>, dequeue: bool) -> Result<(), FlowError> {
        let kill_all = ctx.kill.kill_type() == KillType::All;
        if kill_all {
            if let Some(job) = &self.job {
                if ctx.registry.mark_killed_all(&self.name) {
                    info!(job = %self.name, "Killing all running builds for: '{}'", self.name);
                    job.stop_all()?;
                }
            }
        }

        if self.state.checking_status == Checking::Finished {
            return Ok(());
        }
        let Some(job) = self.job.clone() else {
            self.state.checking_status = Checking::Finished;
            return Ok(());
        };

        if kill_all {
            job.poll()?;
            let status = job.job_status()?;
            if status.progress.is_idle() {
                self.finish_killed(status.result);
            }
            return Ok(());
        }

        // Nothing was started by this run in the current attempt
        let invocation = match (&self.invocation, self.state.is_invoked()) {
            (Some(invocation), true) => Arc::clone(invocation),
            _ => {
                self.state.checking_status = Checking::Finished;
                return Ok(());
            }
        };

        let (result, progress) = invocation.status()?;
        if progress.is_idle() {
            self.finish_killed(result);
        } else if !self.stop_sent {
            info!(job = %self.name, progress = %progress, "Stopping {}", self.repr());
            invocation.stop(dequeue && progress == Progress::Queued)?;
            self.stop_sent = true;
        }
        Ok(())
    }

    fn finish_killed(&mut self, result: BuildResult) {
        self.state.checking_status = Checking::Finished;
        self.state.result = result;
        info!(job = %self.name, "{} stopped running", self.repr());
        info!(job = %self.name, result = %result, "{result}: '{}'", self.name);
    }

    pub(crate) fn show_job_definition(&self, order: &[String]) {
        let shown = display_order(&self.display_params(), order);
        match &self.job {
            Some(job) => {
                let suffix = if shown.is_empty() { "" } else { " - parameters:" };
                info!(job = %self.name, "Defined Job {}{suffix}", job.public_url());
            }
            None => info!(job = %self.name, "Defined Job '{}' - MISSING JOB", self.name),
        }
        for (key, value) in shown {
            info!(job = %self.name, "    {key} = {value:?}");
        }
    }

    pub(crate) fn final_status(&self) {
        let indentation = self.state.indentation();
        let Some(job) = &self.job else {
            info!(job = %self.name, "{indentation}{} - MISSING JOB", self.repr());
            return;
        };
        let result = self.state.result;
        if result == BuildResult::Success {
            info!(job = %self.name, "{indentation}{} {result}", self.repr());
            return;
        }

        let progress = match job.job_status() {
            Ok(status) => status.progress.to_string(),
            Err(err) => {
                warn!(job = %self.name, error = %err, "Could not get final job status");
                "UNKNOWN".to_string()
            }
        };
        let console_url = if result == BuildResult::Unknown {
            String::new()
        } else {
            self.console_url().unwrap_or_default()
        };
        info!(
            job = %self.name,
            "{indentation}{} {result} - {progress} {console_url}",
            self.repr()
        );
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("params", &self.display_params())
            .field("invocation_number", &self.invocation_number)
            .field("has_job", &self.job.is_some())
            .field("has_invocation", &self.invocation.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::TestRun;
    use crate::flow::{ControllerConfig, FlowBuilder, FlowNode, GroupOptions};
    use crate::runner::JobRunnerPort;
    use crate::testing::{MockJob, MockJobRunner};

    fn single_job(runner: &MockJobRunner, config: ControllerConfig, job: &str) -> FlowNode {
        let mut flow = FlowBuilder::new_serial(Arc::new(runner.clone()), config, GroupOptions::new()).unwrap();
        let root = flow.root();
        flow.invoke(root, job, [("password", "s3cret"), ("branch", "main")]).unwrap();
        flow.finish().unwrap().into_root()
    }

    #[test]
    fn test_busy_job_allowed_without_idle_requirement() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("busy").running_elsewhere());
        let mut root = single_job(&runner, ControllerConfig::default(), "busy");

        let mut run = TestRun::new(&runner);
        assert!(matches!(root.prepare_first(&mut run.ctx()), Err(FlowError::JobNotIdle(_))));

        run.settings.require_idle = false;
        root.prepare_first(&mut run.ctx()).unwrap();
    }

    #[test]
    fn test_request_carries_params_and_cause() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("build"));
        let mut root = single_job(&runner, ControllerConfig::default(), "build");

        TestRun::new(&runner).run(&mut root, 5).unwrap();

        let request = runner.last_request("build").unwrap();
        assert_eq!(request.params["password"], "s3cret");
        assert_eq!(request.cause.as_deref(), Some("unit test"));
        let invocation = root.find_invocation("build").unwrap();
        assert_eq!(invocation.display_params()["password"], "******");
        assert_eq!(invocation.console_url().as_deref(), Some("http://mock/job/build/1/console"));
    }

    #[test]
    fn test_allowed_missing_job_fails_when_reached() {
        let runner = MockJobRunner::new();
        let config = ControllerConfig::default().with_allow_missing_jobs(true);
        let mut root = single_job(&runner, config, "later");

        let err = TestRun::new(&runner).run(&mut root, 5).unwrap_err();

        // The enclosing group reports the missing job as its failed child
        assert!(matches!(err.as_failure(), Some(JobFailure::ChildJob { child, .. }) if child == "later"));
        assert_eq!(root.find_invocation("later").unwrap().state().result(), BuildResult::Failure);
    }

    #[test]
    fn test_kill_dequeues_queued_build_once() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("slow").with_queue_ticks(5));
        let mut root = single_job(&runner, ControllerConfig::default(), "slow");
        let mut run = TestRun::new(&runner);
        root.prepare_first(&mut run.ctx()).unwrap();
        run.sweep(&mut root).unwrap();

        run.kill.request(KillType::Current, "test");
        root.kill_check(&mut run.ctx(), true).unwrap();
        root.kill_check(&mut run.ctx(), true).unwrap();

        let invocation = root.find_invocation("slow").unwrap();
        assert_eq!(invocation.state().result(), BuildResult::Dequeued);
        assert_eq!(root.state().checking_status(), Checking::Finished);
        assert_eq!(runner.stop_calls("slow"), 1);
    }

    #[test]
    fn test_kill_sends_stop_once_when_build_starts() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("slow").with_queue_ticks(2).with_exec_ticks(2));
        let mut root = single_job(&runner, ControllerConfig::default(), "slow");
        let mut run = TestRun::new(&runner);
        root.prepare_first(&mut run.ctx()).unwrap();
        run.sweep(&mut root).unwrap();

        run.kill.request(KillType::Current, "test");
        root.kill_check(&mut run.ctx(), false).unwrap();
        runner.quick_poll().unwrap();
        runner.quick_poll().unwrap();
        root.kill_check(&mut run.ctx(), false).unwrap();

        assert_eq!(runner.stop_calls("slow"), 1);
        assert_eq!(root.state().checking_status(), Checking::MustCheck);
    }
}
