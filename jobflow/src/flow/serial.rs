//! Serial groups: children run strictly one after another.

use super::context::SweepContext;
use super::group::GroupState;
use super::node::FlowNode;
use crate::core::{BuildResult, Checking, Propagation};
use crate::errors::{FlowError, JobFailure};
use tracing::{info, warn};

/// A group whose children run in declaration order.
///
/// A failing child restarts the group from its first child while the group
/// has tries left.
#[derive(Debug)]
pub struct SerialGroup {
    pub(crate) group: GroupState,
    /// Index of the child currently being run.
    pub(crate) job_index: usize,
}

impl SerialGroup {
    pub(crate) const ENTER: &'static str = "serial flow: [";
    pub(crate) const EXIT: &'static str = "]";

    /// The group's shared state.
    #[must_use]
    pub fn group(&self) -> &GroupState {
        &self.group
    }

    /// Index of the child currently being run.
    #[must_use]
    pub fn job_index(&self) -> usize {
        self.job_index
    }

    pub(crate) fn sequence(&self) -> String {
        format!("[{}]", self.group.joined_sequence())
    }

    pub(crate) fn prepare_to_invoke(&mut self, reset_tried_times: bool) {
        self.group.node.prepare_to_invoke(reset_tried_times);
        self.job_index = 0;
    }

    pub(crate) fn check(&mut self, ctx: &mut SweepContext<'_>) -> Result<(), FlowError> {
        let sequence = self.sequence();
        let report_now = self.group.check_invoke_report(ctx, &sequence);
        let len = self.group.children.len();

        let mut status = Checking::Finished;
        let end = (self.job_index + 1).min(len);
        for index in 0..end {
            let child = &mut self.group.children[index];
            if child.state().checking_status == Checking::Finished {
                continue;
            }
            match child.check(ctx, report_now) {
                Ok(()) => status = status.min(child.state().propagate_checking_status()),
                Err(FlowError::Retryable(failure)) => {
                    if self.retry_or_finish(index, &failure) {
                        status = Checking::MustCheck;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.group.node.checking_status = status;

        if status == Checking::MustCheck || self.group.node.result != BuildResult::Unknown {
            return self.group.check_timeout(ctx, &sequence);
        }

        let end = (self.job_index + 1).min(len);
        let result = self.group.aggregate(end);
        self.group.node.result = result;
        if result.is_failure() {
            self.group.report_result(ctx, &sequence);
            let child = self.group.worst_child(end).map(FlowNode::sequence).unwrap_or_default();
            return Err(JobFailure::ChildJob {
                flow: sequence,
                child,
                propagation: self.group.node.propagation,
                aborted: self.group.aborted,
            }
            .into());
        }

        self.job_index += 1;
        if self.job_index < len {
            self.group.node.checking_status = Checking::MustCheck;
            self.group.node.result = BuildResult::Unknown;
            return Ok(());
        }

        // All jobs have stopped running or are unchecked
        self.group.report_result(ctx, &sequence);
        Ok(())
    }

    /// Handles a failed child. Returns true when the group restarts in the
    /// current retry scope.
    fn retry_or_finish(&mut self, index: usize, failure: &JobFailure) -> bool {
        let len = self.group.children.len();
        let last = self.job_index.min(len.saturating_sub(1));
        let child = &mut self.group.children[index];
        let propagation = child.state().propagation;
        let remaining = child.state().remaining_tries();
        let remaining_total = child.state().remaining_total_tries();
        let name = child.sequence();

        if failure.is_aborted() {
            warn!(child = %name, "ABORTED: {name} was aborted, it will not be retried");
            child.state_mut().checking_status = Checking::Finished;
            // An unchecked child cannot end its group
            if propagation != Propagation::Unchecked {
                self.group.mark_aborted();
                self.job_index = len;
            }
            return false;
        }

        if remaining > 0 {
            if propagation != Propagation::Normal {
                info!(
                    child = %name,
                    "MAY RETRY: {name} {propagation} failed, will only retry if checked failures. Up to {remaining} more times in current flow"
                );
                return false;
            }
            info!(
                child = %name,
                "RETRY: {name} failed, retrying child jobs from beginning. Up to {remaining} more times in current flow"
            );
            for earlier in &mut self.group.children[..=last] {
                earlier.prepare_to_invoke(false);
            }
            self.job_index = 0;
            return true;
        }

        if remaining_total > 0 {
            if propagation != Propagation::Normal {
                info!(
                    child = %name,
                    "MAY RETRY: {name} {propagation} failed, will only retry if checked failures. Up to {remaining_total} more times through outer flow"
                );
                return false;
            }
            info!(
                child = %name,
                "RETRY: {name} failed, retrying child jobs from beginning. Up to {remaining_total} more times through outer flow"
            );
            for earlier in &mut self.group.children[..=last] {
                earlier.prepare_to_invoke(true);
            }
            self.job_index = 0;
            return false;
        }

        child.state_mut().checking_status = Checking::Finished;
        if propagation != Propagation::Unchecked {
            self.job_index = len;
        }
        false
    }
}
