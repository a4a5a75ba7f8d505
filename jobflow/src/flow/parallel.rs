//! Parallel groups: every child runs at the same time.

use super::context::SweepContext;
use super::group::GroupState;
use crate::core::{BuildResult, Checking, Propagation};
use crate::errors::{FlowError, JobFailure};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A group whose children all run at once. Failed children are retried in
/// place while they have tries left.
#[derive(Debug)]
pub struct ParallelGroup {
    pub(crate) group: GroupState,
    /// Sequences of failed children keyed by node id.
    pub(crate) failed_children: BTreeMap<usize, String>,
}

impl ParallelGroup {
    pub(crate) const ENTER: &'static str = "parallel flow: (";
    pub(crate) const EXIT: &'static str = ")";

    /// The group's shared state.
    #[must_use]
    pub fn group(&self) -> &GroupState {
        &self.group
    }

    /// Sequences of children that failed and were not yet retried successfully.
    #[must_use]
    pub fn failed_children(&self) -> Vec<&str> {
        self.failed_children.values().map(String::as_str).collect()
    }

    pub(crate) fn sequence(&self) -> String {
        format!("({})", self.group.joined_sequence())
    }

    pub(crate) fn prepare_to_invoke(&mut self, reset_tried_times: bool) {
        self.group.node.prepare_to_invoke(reset_tried_times);
    }

    pub(crate) fn check(&mut self, ctx: &mut SweepContext<'_>) -> Result<(), FlowError> {
        let sequence = self.sequence();
        let report_now = self.group.check_invoke_report(ctx, &sequence);

        let mut status = Checking::Finished;
        for child in &mut self.group.children {
            if child.state().checking_status == Checking::Finished {
                continue;
            }
            let node_id = child.state().node_id;
            let failure = match child.check(ctx, report_now) {
                Ok(()) => {
                    status = status.min(child.state().propagate_checking_status());
                    self.failed_children.remove(&node_id);
                    continue;
                }
                Err(FlowError::Retryable(failure)) => failure,
                Err(err) => return Err(err),
            };

            let name = child.sequence();
            self.failed_children.insert(node_id, name.clone());

            if failure.is_aborted() {
                warn!(child = %name, "ABORTED: {name} was aborted, it will not be retried");
                child.state_mut().checking_status = Checking::Finished;
                // An unchecked child cannot end its group
                if child.state().propagation != Propagation::Unchecked {
                    self.group.aborted = true;
                }
                continue;
            }

            let remaining = child.state().remaining_tries();
            if remaining > 0 {
                info!(
                    child = %name,
                    "RETRY: {name} failed but will be retried. Up to {remaining} more times in current flow"
                );
                status = Checking::MustCheck;
                child.prepare_to_invoke(false);
                continue;
            }

            let remaining_total = child.state().remaining_total_tries();
            if remaining_total > 0 {
                info!(
                    child = %name,
                    "RETRY: {name} failed but will be retried. Up to {remaining_total} more times through outer flow"
                );
                child.prepare_to_invoke(true);
                continue;
            }

            child.state_mut().checking_status = Checking::Finished;
        }
        if self.group.aborted {
            self.group.node.exhaust_tries();
        }
        self.group.node.checking_status = status;

        if status == Checking::MustCheck || self.group.node.result != BuildResult::Unknown {
            return self.group.check_timeout(ctx, &sequence);
        }

        // All jobs have stopped running or are unchecked
        let result = self.group.aggregate(self.group.children.len());
        self.group.node.result = result;
        self.group.report_result(ctx, &sequence);

        if result.is_failure() {
            return Err(JobFailure::ChildJobs {
                flow: sequence,
                children: self.failed_children.values().cloned().collect(),
                propagation: self.group.node.propagation,
                aborted: self.group.aborted,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::TestRun;
    use crate::flow::{ControllerConfig, FlowBuilder, FlowNode, GroupOptions};
    use crate::testing::{MockJob, MockJobRunner};
    use crate::utils::params::NO_PARAMS;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn parallel_root(runner: &MockJobRunner, options: GroupOptions, jobs: &[&str]) -> FlowNode {
        let mut flow =
            FlowBuilder::new_parallel(Arc::new(runner.clone()), ControllerConfig::default(), options).unwrap();
        let root = flow.root();
        for job in jobs {
            flow.invoke(root, job, NO_PARAMS).unwrap();
        }
        flow.finish().unwrap().into_root()
    }

    fn as_parallel(node: &FlowNode) -> &ParallelGroup {
        match node {
            FlowNode::Parallel(parallel) => parallel,
            _ => panic!("not a parallel group"),
        }
    }

    #[test]
    fn test_failed_child_retried_in_place() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("a").with_max_fails(1));
        runner.add_job(MockJob::new("b").with_exec_ticks(3));
        let mut root = parallel_root(&runner, GroupOptions::new().with_max_tries(2), &["a", "b"]);
        let mut run = TestRun::new(&runner);
        root.prepare_first(&mut run.ctx()).unwrap();

        run.sweep(&mut root).unwrap();
        run.sweep(&mut root).unwrap();
        assert_eq!(as_parallel(&root).failed_children(), vec!["a"]);

        run.sweep(&mut root).unwrap();
        assert!(as_parallel(&root).failed_children().is_empty());

        run.sweep(&mut root).unwrap();
        assert_eq!(root.state().result(), BuildResult::Success);
        assert_eq!(runner.invocations("a"), 2);
        assert_eq!(runner.invocations("b"), 1);
    }

    #[test]
    fn test_failed_children_reported_together() {
        let runner = MockJobRunner::new();
        runner.add_job(MockJob::new("a").with_max_fails(1));
        runner.add_job(MockJob::new("b").with_max_fails(1));
        runner.add_job(MockJob::new("c"));
        let mut root = parallel_root(&runner, GroupOptions::new(), &["a", "b", "c"]);

        let err = TestRun::new(&runner).run(&mut root, 20).unwrap_err();

        let failure = err.as_failure().unwrap();
        assert_eq!(failure.failed_children(), ["a".to_string(), "b".to_string()]);
        assert_eq!(as_parallel(&root).failed_children(), vec!["a", "b"]);
        assert_eq!(root.state().result(), BuildResult::Failure);
    }
}
