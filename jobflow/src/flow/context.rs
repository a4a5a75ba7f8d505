//! Per-sweep context handed down the node tree.

use crate::cancellation::KillSwitch;
use crate::errors::RunnerError;
use crate::runner::{JobHandle, JobRunnerPort};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Job handles shared by every invocation of the same job name.
#[derive(Default)]
pub(crate) struct JobRegistry {
    handles: HashMap<String, Arc<dyn JobHandle>>,
    killed_all: HashSet<String>,
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Resolves a job once per name; later lookups reuse the handle.
    pub(crate) fn resolve(
        &mut self,
        runner: &dyn JobRunnerPort,
        name: &str,
    ) -> Result<Arc<dyn JobHandle>, RunnerError> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(Arc::clone(handle));
        }
        let handle = runner.get_job(name)?;
        self.handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Records a kill-all for `name`. Returns true the first time only.
    pub(crate) fn mark_killed_all(&mut self, name: &str) -> bool {
        self.killed_all.insert(name.to_string())
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.handles.keys().collect::<Vec<_>>())
            .field("killed_all", &self.killed_all)
            .finish()
    }
}

/// Settings fixed for a whole run.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub(crate) require_idle: bool,
    pub(crate) cause: String,
    pub(crate) description: Option<String>,
    pub(crate) params_display_order: Vec<String>,
}

/// Everything a node needs while it is checked.
pub(crate) struct SweepContext<'a> {
    pub(crate) runner: &'a dyn JobRunnerPort,
    pub(crate) registry: &'a mut JobRegistry,
    pub(crate) kill: &'a KillSwitch,
    pub(crate) settings: &'a RunSettings,
    /// Time of the current sweep.
    pub(crate) now: f64,
    /// Time the outermost flow started.
    pub(crate) start_time: f64,
    /// Set once the controller has switched to stopping builds.
    pub(crate) kill_mode: bool,
}

/// Drives a single node tree by hand in unit tests.
#[cfg(test)]
pub(crate) struct TestRun {
    pub(crate) runner: crate::testing::MockJobRunner,
    pub(crate) registry: JobRegistry,
    pub(crate) kill: KillSwitch,
    pub(crate) settings: RunSettings,
    pub(crate) now: f64,
}

#[cfg(test)]
impl TestRun {
    pub(crate) fn new(runner: &crate::testing::MockJobRunner) -> Self {
        Self {
            runner: runner.clone(),
            registry: JobRegistry::new(),
            kill: KillSwitch::new(),
            settings: RunSettings {
                require_idle: true,
                cause: "unit test".to_string(),
                description: None,
                params_display_order: Vec::new(),
            },
            now: 1.0,
        }
    }

    pub(crate) fn ctx(&mut self) -> SweepContext<'_> {
        SweepContext {
            runner: &self.runner,
            registry: &mut self.registry,
            kill: &self.kill,
            settings: &self.settings,
            now: self.now,
            start_time: 1.0,
            kill_mode: self.kill.is_requested(),
        }
    }

    /// Advances the runner one tick and checks `node` once.
    pub(crate) fn sweep(&mut self, node: &mut super::FlowNode) -> Result<(), crate::errors::FlowError> {
        self.runner.quick_poll()?;
        self.now += 1.0;
        node.check(&mut self.ctx(), false)
    }

    /// Prepares `node` and sweeps it until it stops needing checks.
    pub(crate) fn run(&mut self, node: &mut super::FlowNode, max_sweeps: usize) -> Result<(), crate::errors::FlowError> {
        node.prepare_first(&mut self.ctx())?;
        for _ in 0..max_sweeps {
            if node.state().checking_status() != crate::core::Checking::MustCheck {
                break;
            }
            self.sweep(node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockJob, MockJobRunner};

    #[test]
    fn test_registry_resolves_once() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("build"));
        let mut registry = JobRegistry::new();

        let first = registry.resolve(&runner, "build").unwrap();
        let second = registry.resolve(&runner, "build").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(runner.get_job_calls("build"), 1);
    }

    #[test]
    fn test_registry_unknown_job() {
        let runner = MockJobRunner::new();
        let mut registry = JobRegistry::new();
        let err = registry.resolve(&runner, "nope").err().unwrap();
        assert!(err.is_unknown_job());
    }

    #[test]
    fn test_mark_killed_all_once() {
        let mut registry = JobRegistry::new();
        assert!(registry.mark_killed_all("deploy"));
        assert!(!registry.mark_killed_all("deploy"));
    }
}
