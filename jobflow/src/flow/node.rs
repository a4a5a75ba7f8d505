//! Node state shared by every flow node, and the closed node union.

use super::context::SweepContext;
use super::invocation::Invocation;
use super::parallel::ParallelGroup;
use super::serial::SerialGroup;
use crate::core::{BuildResult, Checking, Propagation};
use crate::errors::FlowError;
use crate::utils::elapsed_message;
use tracing::info;

/// Identity, retry and propagation bookkeeping common to all nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub(crate) node_id: usize,
    pub(crate) nesting_level: i32,
    pub(crate) max_tries: u32,
    pub(crate) total_max_tries: u32,
    pub(crate) tried_times: u32,
    pub(crate) total_tried_times: u32,
    pub(crate) propagation: Propagation,
    pub(crate) checking_status: Checking,
    pub(crate) result: BuildResult,
    pub(crate) invocation_time: f64,
    pub(crate) message: Option<String>,
}

impl NodeState {
    pub(crate) fn new(
        node_id: usize,
        nesting_level: i32,
        max_tries: u32,
        total_max_tries: u32,
        propagation: Propagation,
    ) -> Self {
        Self {
            node_id,
            nesting_level,
            max_tries,
            total_max_tries,
            tried_times: 0,
            total_tried_times: 0,
            propagation,
            checking_status: Checking::MustCheck,
            result: BuildResult::Unknown,
            invocation_time: 0.0,
            message: None,
        }
    }

    /// Identifier assigned in declaration order.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Depth in the tree; the root is 0.
    #[must_use]
    pub fn nesting_level(&self) -> i32 {
        self.nesting_level
    }

    /// Tries allowed in the current retry scope.
    #[must_use]
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Tries allowed across all enclosing retry scopes.
    #[must_use]
    pub fn total_max_tries(&self) -> u32 {
        self.total_max_tries
    }

    /// Tries used in the current retry scope.
    #[must_use]
    pub fn tried_times(&self) -> u32 {
        self.tried_times
    }

    /// Tries used in total.
    #[must_use]
    pub fn total_tried_times(&self) -> u32 {
        self.total_tried_times
    }

    /// The node's propagation.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// The node's checking status.
    #[must_use]
    pub fn checking_status(&self) -> Checking {
        self.checking_status
    }

    /// The node's raw result.
    #[must_use]
    pub fn result(&self) -> BuildResult {
        self.result
    }

    /// Start of the current attempt in epoch seconds, `0.0` before it.
    #[must_use]
    pub fn invocation_time(&self) -> f64 {
        self.invocation_time
    }

    /// The annotation printed before the node is invoked.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The result as seen by the parent.
    #[must_use]
    pub fn propagate_result(&self) -> BuildResult {
        if matches!(self.result, BuildResult::Success | BuildResult::Superseded)
            || self.propagation == Propagation::Unchecked
        {
            return BuildResult::Success;
        }
        if self.result == BuildResult::Unstable || self.propagation == Propagation::FailureToUnstable {
            return BuildResult::Unstable;
        }
        BuildResult::Failure
    }

    /// The checking status as seen by the parent.
    #[must_use]
    pub fn propagate_checking_status(&self) -> Checking {
        if self.propagation == Propagation::Unchecked {
            return self.checking_status.max(Checking::HasUnchecked);
        }
        self.checking_status
    }

    /// Tries left in the current retry scope.
    #[must_use]
    pub fn remaining_tries(&self) -> u32 {
        self.max_tries.saturating_sub(self.tried_times)
    }

    /// Tries left across all enclosing retry scopes.
    #[must_use]
    pub fn remaining_total_tries(&self) -> u32 {
        self.total_max_tries.saturating_sub(self.total_tried_times)
    }

    /// Starts a new attempt.
    pub(crate) fn prepare_to_invoke(&mut self, reset_tried_times: bool) {
        self.checking_status = if self.propagation == Propagation::Unchecked {
            Checking::HasUnchecked
        } else {
            Checking::MustCheck
        };
        self.result = BuildResult::Unknown;
        self.tried_times = if reset_tried_times { 1 } else { self.tried_times + 1 };
        self.total_tried_times += 1;
        self.invocation_time = 0.0;
    }

    /// Uses up every try so no level retries this node again.
    pub(crate) fn exhaust_tries(&mut self) {
        self.tried_times = self.max_tries;
        self.total_tried_times = self.total_max_tries;
    }

    pub(crate) fn is_invoked(&self) -> bool {
        self.invocation_time > 0.0
    }

    /// Records the start of the attempt. Returns false if already started.
    pub(crate) fn must_invoke_set_invocation_time(&mut self, now: f64) -> bool {
        if self.is_invoked() {
            return false;
        }
        self.invocation_time = now;
        true
    }

    pub(crate) fn invocation_message(&self, kind: &str, repr: &str) {
        if let Some(message) = &self.message {
            info!(node_id = self.node_id, "{message}");
        }
        info!(
            node_id = self.node_id,
            "Invoking {kind} ({}/{},{}/{}): {repr}",
            self.tried_times,
            self.max_tries,
            self.total_tried_times,
            self.total_max_tries
        );
    }

    pub(crate) fn time_msg(&self, now: f64, start_time: f64) -> String {
        elapsed_message(now, self.invocation_time, start_time)
    }

    pub(crate) fn indentation(&self) -> String {
        " ".repeat(3 * usize::try_from(self.nesting_level).unwrap_or(0))
    }
}

/// A node of the flow tree.
#[derive(Debug)]
pub enum FlowNode {
    /// A single job invocation.
    Invocation(Invocation),
    /// Children run one after another.
    Serial(SerialGroup),
    /// Children run at the same time.
    Parallel(ParallelGroup),
}

impl FlowNode {
    /// Shared bookkeeping of the node.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        match self {
            Self::Invocation(invocation) => &invocation.state,
            Self::Serial(serial) => &serial.group.node,
            Self::Parallel(parallel) => &parallel.group.node,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut NodeState {
        match self {
            Self::Invocation(invocation) => &mut invocation.state,
            Self::Serial(serial) => &mut serial.group.node,
            Self::Parallel(parallel) => &mut parallel.group.node,
        }
    }

    /// Compact rendering: job names, `[..]` for serial and `(..)` for parallel.
    #[must_use]
    pub fn sequence(&self) -> String {
        match self {
            Self::Invocation(invocation) => invocation.sequence(),
            Self::Serial(serial) => serial.sequence(),
            Self::Parallel(parallel) => parallel.sequence(),
        }
    }

    /// Direct children; empty for invocations.
    #[must_use]
    pub fn children(&self) -> &[FlowNode] {
        match self {
            Self::Invocation(_) => &[],
            Self::Serial(serial) => &serial.group.children,
            Self::Parallel(parallel) => &parallel.group.children,
        }
    }

    /// All invocations below this node in declaration order.
    #[must_use]
    pub fn invocations(&self) -> Vec<&Invocation> {
        let mut found = Vec::new();
        self.collect_invocations(&mut found);
        found
    }

    fn collect_invocations<'a>(&'a self, found: &mut Vec<&'a Invocation>) {
        match self {
            Self::Invocation(invocation) => found.push(invocation),
            _ => {
                for child in self.children() {
                    child.collect_invocations(found);
                }
            }
        }
    }

    /// Finds the first invocation of a job by its full name.
    #[must_use]
    pub fn find_invocation(&self, name: &str) -> Option<&Invocation> {
        self.invocations().into_iter().find(|invocation| invocation.name() == name)
    }

    /// Invocations that the next sibling in a serial group depends on.
    #[must_use]
    pub fn last_jobs_in_flow(&self) -> Vec<&Invocation> {
        match self {
            Self::Invocation(invocation) => {
                if invocation.state.propagation == Propagation::Unchecked {
                    Vec::new()
                } else {
                    vec![invocation]
                }
            }
            Self::Serial(serial) => serial
                .group
                .children
                .iter()
                .rev()
                .map(Self::last_jobs_in_flow)
                .find(|jobs| !jobs.is_empty())
                .unwrap_or_default(),
            Self::Parallel(parallel) => parallel
                .group
                .children
                .iter()
                .flat_map(Self::last_jobs_in_flow)
                .collect(),
        }
    }

    pub(crate) fn prepare_first(&mut self, ctx: &mut SweepContext<'_>) -> Result<(), FlowError> {
        match self {
            Self::Invocation(invocation) => invocation.prepare_first(ctx),
            Self::Serial(serial) => {
                serial.prepare_to_invoke(false);
                serial.group.prepare_children(ctx, SerialGroup::ENTER, SerialGroup::EXIT)
            }
            Self::Parallel(parallel) => {
                parallel.prepare_to_invoke(false);
                parallel.group.prepare_children(ctx, ParallelGroup::ENTER, ParallelGroup::EXIT)
            }
        }
    }

    pub(crate) fn prepare_to_invoke(&mut self, reset_tried_times: bool) {
        match self {
            Self::Invocation(invocation) => invocation.prepare_to_invoke(reset_tried_times),
            Self::Serial(serial) => serial.prepare_to_invoke(reset_tried_times),
            Self::Parallel(parallel) => parallel.prepare_to_invoke(reset_tried_times),
        }
    }

    /// One polling step. A retryable error tells the parent this node failed.
    pub(crate) fn check(&mut self, ctx: &mut SweepContext<'_>, report_now: bool) -> Result<(), FlowError> {
        match self {
            Self::Invocation(invocation) => invocation.check(ctx, report_now),
            Self::Serial(serial) => serial.check(ctx),
            Self::Parallel(parallel) => parallel.check(ctx),
        }
    }

    /// One step of stopping builds; never retries.
    pub(crate) fn kill_check(&mut self, ctx: &mut SweepContext<'_>, dequeue: bool) -> Result<(), FlowError> {
        match self {
            Self::Invocation(invocation) => invocation.kill_check(ctx, dequeue),
            Self::Serial(serial) => serial.group.kill_check(ctx, dequeue),
            Self::Parallel(parallel) => parallel.group.kill_check(ctx, dequeue),
        }
    }

    pub(crate) fn show_job_definition(&self, display_order: &[String]) {
        match self {
            Self::Invocation(invocation) => invocation.show_job_definition(display_order),
            _ => {
                for child in self.children() {
                    child.show_job_definition(display_order);
                }
            }
        }
    }

    pub(crate) fn final_status(&self) {
        match self {
            Self::Invocation(invocation) => invocation.final_status(),
            Self::Serial(serial) => serial.group.final_status(SerialGroup::ENTER, SerialGroup::EXIT),
            Self::Parallel(parallel) => parallel.group.final_status(ParallelGroup::ENTER, ParallelGroup::EXIT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(propagation: Propagation) -> NodeState {
        NodeState::new(1, 1, 2, 4, propagation)
    }

    #[test]
    fn test_propagate_result() {
        let mut node = state(Propagation::Normal);
        node.result = BuildResult::Superseded;
        assert_eq!(node.propagate_result(), BuildResult::Success);
        node.result = BuildResult::Unstable;
        assert_eq!(node.propagate_result(), BuildResult::Unstable);
        node.result = BuildResult::Aborted;
        assert_eq!(node.propagate_result(), BuildResult::Failure);
        node.result = BuildResult::Unknown;
        assert_eq!(node.propagate_result(), BuildResult::Failure);

        let mut node = state(Propagation::FailureToUnstable);
        node.result = BuildResult::Failure;
        assert_eq!(node.propagate_result(), BuildResult::Unstable);

        let mut node = state(Propagation::Unchecked);
        node.result = BuildResult::Failure;
        assert_eq!(node.propagate_result(), BuildResult::Success);
    }

    #[test]
    fn test_propagate_checking_status_clamps_unchecked() {
        let node = state(Propagation::Unchecked);
        assert_eq!(node.checking_status, Checking::MustCheck);
        assert_eq!(node.propagate_checking_status(), Checking::HasUnchecked);

        let node = state(Propagation::Normal);
        assert_eq!(node.propagate_checking_status(), Checking::MustCheck);
    }

    #[test]
    fn test_prepare_to_invoke_counts_tries() {
        let mut node = state(Propagation::Normal);
        node.prepare_to_invoke(false);
        node.prepare_to_invoke(false);
        assert_eq!((node.tried_times, node.total_tried_times), (2, 2));
        assert_eq!(node.remaining_tries(), 0);
        assert_eq!(node.remaining_total_tries(), 2);

        node.invocation_time = 10.0;
        node.prepare_to_invoke(true);
        assert_eq!((node.tried_times, node.total_tried_times), (1, 3));
        assert_eq!(node.result, BuildResult::Unknown);
        assert!(!node.is_invoked());
    }

    #[test]
    fn test_prepare_to_invoke_unchecked_status() {
        let mut node = state(Propagation::Unchecked);
        node.prepare_to_invoke(false);
        assert_eq!(node.checking_status, Checking::HasUnchecked);
    }

    #[test]
    fn test_remaining_tries_never_negative() {
        let mut node = state(Propagation::Normal);
        node.tried_times = 5;
        node.total_tried_times = 9;
        assert_eq!(node.remaining_tries(), 0);
        assert_eq!(node.remaining_total_tries(), 0);
    }

    #[test]
    fn test_must_invoke_only_once_per_attempt() {
        let mut node = state(Propagation::Normal);
        assert!(node.must_invoke_set_invocation_time(100.0));
        assert!(!node.must_invoke_set_invocation_time(101.0));
        assert!((node.invocation_time - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exhaust_tries() {
        let mut node = state(Propagation::Normal);
        node.exhaust_tries();
        assert_eq!(node.remaining_tries(), 0);
        assert_eq!(node.remaining_total_tries(), 0);
    }

    #[test]
    fn test_indentation() {
        let node = NodeState::new(0, 2, 1, 1, Propagation::Normal);
        assert_eq!(node.indentation(), "      ");
    }
}
