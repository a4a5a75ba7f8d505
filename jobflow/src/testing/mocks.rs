//! In-memory job runner for tests.
//!
//! Time is counted in ticks. Every [`JobRunnerPort::quick_poll`] advances the
//! clock by one tick, so one controller sweep is one tick. A build is queued
//! for `queue_ticks`, runs for `exec_ticks` and then reports its planned
//! result.

use crate::cancellation::KillSwitch;
use crate::core::{BuildResult, KillType, Progress};
use crate::errors::RunnerError;
use crate::runner::{InvocationHandle, InvokeRequest, JobHandle, JobRunnerPort, JobStatus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Ticks a build started elsewhere keeps running.
const ELSEWHERE_TICKS: u64 = 1_000_000;

/// Behavior of one mock job.
#[derive(Debug, Clone)]
pub struct MockJob {
    name: String,
    queue_ticks: u64,
    exec_ticks: u64,
    max_fails: usize,
    fail_result: BuildResult,
    final_result: BuildResult,
    running_elsewhere: bool,
    missing: bool,
    creates_job: Option<String>,
}

impl MockJob {
    /// A job whose builds run for one tick and succeed.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_ticks: 0,
            exec_ticks: 1,
            max_fails: 0,
            fail_result: BuildResult::Failure,
            final_result: BuildResult::Success,
            running_elsewhere: false,
            missing: false,
            creates_job: None,
        }
    }

    /// Ticks each build waits in the queue.
    #[must_use]
    pub fn with_queue_ticks(mut self, ticks: u64) -> Self {
        self.queue_ticks = ticks;
        self
    }

    /// Ticks each build runs.
    #[must_use]
    pub fn with_exec_ticks(mut self, ticks: u64) -> Self {
        self.exec_ticks = ticks;
        self
    }

    /// The first `max_fails` builds end with the fail result.
    #[must_use]
    pub fn with_max_fails(mut self, max_fails: usize) -> Self {
        self.max_fails = max_fails;
        self
    }

    /// Result of failing builds, `FAILURE` by default.
    #[must_use]
    pub fn with_fail_result(mut self, result: BuildResult) -> Self {
        self.fail_result = result;
        self
    }

    /// Result of builds after the failing ones, `SUCCESS` by default.
    #[must_use]
    pub fn with_final_result(mut self, result: BuildResult) -> Self {
        self.final_result = result;
        self
    }

    /// Starts with a build that someone else started and that keeps running.
    #[must_use]
    pub fn running_elsewhere(mut self) -> Self {
        self.running_elsewhere = true;
        self
    }

    /// The job does not exist until it is created.
    #[must_use]
    pub fn missing(mut self) -> Self {
        self.missing = true;
        self
    }

    /// Creates the job `name` when a build of this job finishes.
    #[must_use]
    pub fn creates_job(mut self, name: impl Into<String>) -> Self {
        self.creates_job = Some(name.into());
        self
    }
}

#[derive(Debug, Clone)]
struct MockBuild {
    number: u64,
    enqueued_at: u64,
    queue_ticks: u64,
    exec_ticks: u64,
    planned: BuildResult,
    /// Result forced by a stop, dequeue or supersede, and its tick.
    forced: Option<(BuildResult, u64)>,
    by_flow: bool,
    description: String,
}

impl MockBuild {
    fn status(&self, tick: u64) -> (BuildResult, Progress) {
        if let Some((result, _)) = self.forced {
            return (result, Progress::Idle);
        }
        let start = self.enqueued_at + self.queue_ticks;
        if tick < start {
            (BuildResult::Unknown, Progress::Queued)
        } else if tick < start + self.exec_ticks {
            (BuildResult::Unknown, Progress::Running)
        } else {
            (self.planned, Progress::Idle)
        }
    }

    fn finished_at(&self, tick: u64) -> Option<u64> {
        if let Some((_, at)) = self.forced {
            return Some(at);
        }
        let end = self.enqueued_at + self.queue_ticks + self.exec_ticks;
        (tick >= end).then_some(end)
    }

    /// Stops the build as the runner would. Returns true if it changed.
    fn stop(&mut self, tick: u64, dequeue: bool) -> bool {
        match self.status(tick).1 {
            Progress::Queued if dequeue => self.forced = Some((BuildResult::Dequeued, tick)),
            Progress::Running => self.forced = Some((BuildResult::Aborted, tick)),
            _ => return false,
        }
        true
    }
}

#[derive(Debug)]
struct MockJobState {
    config: MockJob,
    present: bool,
    builds: Vec<MockBuild>,
    requests: Vec<InvokeRequest>,
    stop_calls: usize,
    stop_all_calls: usize,
    get_job_calls: usize,
}

impl MockJobState {
    fn new(config: MockJob) -> Self {
        let mut state = Self {
            present: !config.missing,
            builds: Vec::new(),
            requests: Vec::new(),
            stop_calls: 0,
            stop_all_calls: 0,
            get_job_calls: 0,
            config,
        };
        if state.config.running_elsewhere {
            state.builds.push(MockBuild {
                number: 1,
                enqueued_at: 0,
                queue_ticks: 0,
                exec_ticks: ELSEWHERE_TICKS,
                planned: BuildResult::Success,
                forced: None,
                by_flow: false,
                description: String::new(),
            });
        }
        state
    }

    fn flow_builds(&self) -> impl Iterator<Item = &MockBuild> {
        self.builds.iter().filter(|build| build.by_flow)
    }

    fn job_status(&self, tick: u64) -> JobStatus {
        let statuses: Vec<_> = self.builds.iter().map(|build| build.status(tick)).collect();
        let progress = if statuses.iter().any(|(_, p)| *p == Progress::Running) {
            Progress::Running
        } else if statuses.iter().any(|(_, p)| *p == Progress::Queued) {
            Progress::Queued
        } else {
            Progress::Idle
        };
        JobStatus {
            result: statuses.last().map_or(BuildResult::Unknown, |(result, _)| *result),
            progress,
            last_build_number: self.builds.last().map(|build| build.number),
        }
    }
}

struct KillHook {
    tick: u64,
    kill: Arc<KillSwitch>,
    kind: KillType,
}

#[derive(Default)]
struct MockState {
    tick: u64,
    jobs: BTreeMap<String, MockJobState>,
    invocation_order: Vec<String>,
    get_job_misses: HashMap<String, usize>,
    kill_hooks: Vec<KillHook>,
}

impl MockState {
    fn job(&self, name: &str) -> Result<&MockJobState, RunnerError> {
        self.jobs
            .get(name)
            .filter(|job| job.present)
            .ok_or_else(|| RunnerError::UnknownJob { name: name.to_string() })
    }

    fn job_mut(&mut self, name: &str) -> Result<&mut MockJobState, RunnerError> {
        self.jobs
            .get_mut(name)
            .filter(|job| job.present)
            .ok_or_else(|| RunnerError::UnknownJob { name: name.to_string() })
    }

    /// Makes jobs created by finished builds visible.
    fn create_pending_jobs(&mut self) {
        let tick = self.tick;
        let created: Vec<String> = self
            .jobs
            .values()
            .filter(|job| job.flow_builds().any(|build| build.finished_at(tick).is_some()))
            .filter_map(|job| job.config.creates_job.clone())
            .collect();
        for name in created {
            self.jobs
                .entry(name.clone())
                .or_insert_with(|| MockJobState::new(MockJob::new(name)))
                .present = true;
        }
    }
}

/// A [`JobRunnerPort`] backed by in-memory jobs.
#[derive(Clone, Default)]
pub struct MockJobRunner {
    state: Arc<Mutex<MockState>>,
}

impl MockJobRunner {
    /// Creates a runner without jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job.
    pub fn add_job(&self, job: MockJob) {
        let mut state = self.state.lock();
        state.jobs.insert(job.name.clone(), MockJobState::new(job));
    }

    /// Requests a kill on `kill` once the clock reaches `tick`.
    pub fn kill_at_tick(&self, tick: u64, kill: Arc<KillSwitch>, kind: KillType) {
        self.state.lock().kill_hooks.push(KillHook { tick, kill, kind });
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.state.lock().tick
    }

    /// Number of builds of `name` started through the runner.
    #[must_use]
    pub fn invocations(&self, name: &str) -> usize {
        self.state
            .lock()
            .jobs
            .get(name)
            .map_or(0, |job| job.flow_builds().count())
    }

    /// Job names in the order they were invoked.
    #[must_use]
    pub fn invocation_order(&self) -> Vec<String> {
        self.state.lock().invocation_order.clone()
    }

    /// Ticks at which builds of `name` were started through the runner.
    #[must_use]
    pub fn invoked_at(&self, name: &str) -> Vec<u64> {
        self.state
            .lock()
            .jobs
            .get(name)
            .map(|job| job.flow_builds().map(|build| build.enqueued_at).collect())
            .unwrap_or_default()
    }

    /// Ticks at which builds of `name` started through the runner finished.
    #[must_use]
    pub fn finished_at(&self, name: &str) -> Vec<Option<u64>> {
        let state = self.state.lock();
        let tick = state.tick;
        state
            .jobs
            .get(name)
            .map(|job| job.flow_builds().map(|build| build.finished_at(tick)).collect())
            .unwrap_or_default()
    }

    /// Current results of every build of `name`, including foreign ones.
    #[must_use]
    pub fn build_results(&self, name: &str) -> Vec<BuildResult> {
        let state = self.state.lock();
        let tick = state.tick;
        state
            .jobs
            .get(name)
            .map(|job| job.builds.iter().map(|build| build.status(tick).0).collect())
            .unwrap_or_default()
    }

    /// Number of `stop` calls on builds of `name`.
    #[must_use]
    pub fn stop_calls(&self, name: &str) -> usize {
        self.state.lock().jobs.get(name).map_or(0, |job| job.stop_calls)
    }

    /// Number of `stop_all` calls on `name`.
    #[must_use]
    pub fn stop_all_calls(&self, name: &str) -> usize {
        self.state.lock().jobs.get(name).map_or(0, |job| job.stop_all_calls)
    }

    /// Number of lookups of `name`, including failed ones.
    #[must_use]
    pub fn get_job_calls(&self, name: &str) -> usize {
        let state = self.state.lock();
        let found = state.jobs.get(name).map_or(0, |job| job.get_job_calls);
        found + state.get_job_misses.get(name).copied().unwrap_or(0)
    }

    /// The request of the latest build of `name`.
    #[must_use]
    pub fn last_request(&self, name: &str) -> Option<InvokeRequest> {
        self.state
            .lock()
            .jobs
            .get(name)
            .and_then(|job| job.requests.last().cloned())
    }

    /// Description of the latest build of `name`.
    #[must_use]
    pub fn last_description(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .jobs
            .get(name)
            .and_then(|job| job.builds.last().map(|build| build.description.clone()))
    }
}

impl std::fmt::Debug for MockJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockJobRunner")
            .field("tick", &state.tick)
            .field("jobs", &state.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRunnerPort for MockJobRunner {
    fn poll(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn quick_poll(&self) -> Result<(), RunnerError> {
        let fired: Vec<KillHook> = {
            let mut state = self.state.lock();
            state.tick += 1;
            state.create_pending_jobs();
            let tick = state.tick;
            let (fired, pending) = state.kill_hooks.drain(..).partition(|hook| hook.tick <= tick);
            state.kill_hooks = pending;
            fired
        };
        for hook in fired {
            hook.kill.request(hook.kind, "kill requested by mock runner");
        }
        Ok(())
    }

    fn queue_poll(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn get_job(&self, name: &str) -> Result<Arc<dyn JobHandle>, RunnerError> {
        let mut state = self.state.lock();
        if let Err(err) = state.job_mut(name).map(|job| job.get_job_calls += 1) {
            *state.get_job_misses.entry(name.to_string()).or_insert(0) += 1;
            return Err(err);
        }
        Ok(Arc::new(MockJobHandle {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        }))
    }

    fn create_job(&self, name: &str, _definition: &str) -> Result<(), RunnerError> {
        let mut state = self.state.lock();
        state
            .jobs
            .entry(name.to_string())
            .or_insert_with(|| MockJobState::new(MockJob::new(name)))
            .present = true;
        Ok(())
    }

    fn delete_job(&self, name: &str) -> Result<(), RunnerError> {
        let mut state = self.state.lock();
        state.job(name)?;
        state.jobs.remove(name);
        Ok(())
    }
}

/// A job of a [`MockJobRunner`].
pub struct MockJobHandle {
    state: Arc<Mutex<MockState>>,
    name: String,
}

impl JobHandle for MockJobHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn public_url(&self) -> String {
        format!("http://mock/job/{}", self.name)
    }

    fn job_status(&self) -> Result<JobStatus, RunnerError> {
        let state = self.state.lock();
        let tick = state.tick;
        Ok(state.job(&self.name)?.job_status(tick))
    }

    fn invoke(&self, request: InvokeRequest) -> Result<Arc<dyn InvocationHandle>, RunnerError> {
        let mut state = self.state.lock();
        let tick = state.tick;
        let job = state.job_mut(&self.name)?;

        // A new build replaces a queued one from an earlier request
        for build in job.builds.iter_mut().filter(|build| build.by_flow) {
            if build.status(tick).1 == Progress::Queued {
                build.forced = Some((BuildResult::Superseded, tick));
            }
        }

        let planned = if job.flow_builds().count() < job.config.max_fails {
            job.config.fail_result
        } else {
            job.config.final_result
        };
        let number = job.builds.last().map_or(1, |build| build.number + 1);
        job.builds.push(MockBuild {
            number,
            enqueued_at: tick,
            queue_ticks: job.config.queue_ticks,
            exec_ticks: job.config.exec_ticks,
            planned,
            forced: None,
            by_flow: true,
            description: request.description.clone().unwrap_or_default(),
        });
        job.requests.push(request);
        let index = job.builds.len() - 1;
        state.invocation_order.push(self.name.clone());

        Ok(Arc::new(MockInvocation {
            state: Arc::clone(&self.state),
            name: self.name.clone(),
            index,
            number,
        }))
    }

    fn poll(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn stop_all(&self) -> Result<(), RunnerError> {
        let mut state = self.state.lock();
        let tick = state.tick;
        let job = state.job_mut(&self.name)?;
        job.stop_all_calls += 1;
        for build in &mut job.builds {
            build.stop(tick, true);
        }
        Ok(())
    }
}

/// One build started through a [`MockJobHandle`].
pub struct MockInvocation {
    state: Arc<Mutex<MockState>>,
    name: String,
    index: usize,
    number: u64,
}

impl MockInvocation {
    fn with_build<T>(&self, f: impl FnOnce(&mut MockJobState, u64) -> T) -> Result<T, RunnerError> {
        let mut state = self.state.lock();
        let tick = state.tick;
        let job = state.job_mut(&self.name)?;
        Ok(f(job, tick))
    }
}

impl InvocationHandle for MockInvocation {
    fn status(&self) -> Result<(BuildResult, Progress), RunnerError> {
        self.with_build(|job, tick| job.builds[self.index].status(tick))
    }

    fn stop(&self, dequeue: bool) -> Result<(), RunnerError> {
        self.with_build(|job, tick| {
            job.stop_calls += 1;
            job.builds[self.index].stop(tick, dequeue);
        })
    }

    fn console_url(&self) -> Option<String> {
        Some(format!("http://mock/job/{}/{}/console", self.name, self.number))
    }

    fn set_description(&self, description: &str, replace: bool, separator: &str) -> Result<(), RunnerError> {
        self.with_build(|job, _| {
            let build = &mut job.builds[self.index];
            if replace || build.description.is_empty() {
                build.description = description.to_string();
            } else {
                build.description = format!("{}{separator}{description}", build.description);
            }
        })
    }
}
