//! State and behavior shared by serial and parallel groups.

use super::context::SweepContext;
use super::node::{FlowNode, NodeState};
use crate::core::{BuildResult, Checking, KillType, Propagation};
use crate::errors::{FlowError, FlowTimeoutError};
use tracing::info;

/// The part of a group that does not depend on how children are scheduled.
#[derive(Debug)]
pub struct GroupState {
    pub(crate) node: NodeState,
    pub(crate) children: Vec<FlowNode>,
    /// Seconds, `0.0` for no timeout.
    pub(crate) timeout: f64,
    pub(crate) report_interval: f64,
    pub(crate) last_report_time: f64,
    pub(crate) job_name_prefix: String,
    /// Set once a child failed because a build was aborted.
    pub(crate) aborted: bool,
}

impl GroupState {
    /// Shared bookkeeping of the group.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.node
    }

    /// The group's children in declaration order.
    #[must_use]
    pub fn children(&self) -> &[FlowNode] {
        &self.children
    }

    /// Prefix applied to job names in this group.
    #[must_use]
    pub fn job_name_prefix(&self) -> &str {
        &self.job_name_prefix
    }

    /// Timeout in seconds, `0.0` when unbounded.
    #[must_use]
    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub(crate) fn joined_sequence(&self) -> String {
        self.children
            .iter()
            .map(FlowNode::sequence)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn prepare_children(
        &mut self,
        ctx: &mut SweepContext<'_>,
        enter: &str,
        exit: &str,
    ) -> Result<(), FlowError> {
        let indentation = self.node.indentation();
        info!("{indentation}{enter}");
        for child in &mut self.children {
            child.prepare_first(ctx)?;
        }
        info!("{indentation}{exit}");
        Ok(())
    }

    /// Starts the attempt on first use and decides whether children report now.
    pub(crate) fn check_invoke_report(&mut self, ctx: &SweepContext<'_>, sequence: &str) -> bool {
        if self.node.must_invoke_set_invocation_time(ctx.now) {
            self.node.invocation_message("Flow", sequence);
        }

        let report_now = ctx.now - self.last_report_time >= self.report_interval;
        if report_now {
            self.last_report_time = ctx.now;
        }
        report_now
    }

    pub(crate) fn check_timeout(&self, ctx: &SweepContext<'_>, sequence: &str) -> Result<(), FlowError> {
        if self.timeout > 0.0 && ctx.now - self.node.invocation_time > self.timeout {
            let unfinished = self
                .children
                .iter()
                .filter(|child| child.state().checking_status == Checking::MustCheck)
                .map(FlowNode::sequence)
                .collect();
            return Err(FlowTimeoutError {
                flow: sequence.to_string(),
                elapsed: self.node.time_msg(ctx.now, ctx.start_time),
                unfinished,
                propagation: self.node.propagation,
            }
            .into());
        }
        Ok(())
    }

    /// Aggregate of the first `end` children as seen by this group.
    pub(crate) fn aggregate(&self, end: usize) -> BuildResult {
        self.children[..end.min(self.children.len())]
            .iter()
            .map(|child| child.state().propagate_result())
            .fold(self.node.result, BuildResult::min)
    }

    /// The child with the worst propagated result among the first `end`.
    pub(crate) fn worst_child(&self, end: usize) -> Option<&FlowNode> {
        self.children[..end.min(self.children.len())]
            .iter()
            .min_by_key(|child| child.state().propagate_result())
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
        self.node.exhaust_tries();
    }

    pub(crate) fn report_result(&self, ctx: &SweepContext<'_>, sequence: &str) {
        let unchecked = if self.node.propagation == Propagation::Unchecked {
            "UNCHECKED "
        } else {
            ""
        };
        info!(
            node_id = self.node.node_id,
            result = %self.node.result,
            "Flow {unchecked}{} {sequence} {}",
            self.node.result,
            self.node.time_msg(ctx.now, ctx.start_time)
        );
    }

    /// Stops builds below this group; the group settles once every child has.
    pub(crate) fn kill_check(&mut self, ctx: &mut SweepContext<'_>, dequeue: bool) -> Result<(), FlowError> {
        // Kill-all also reaches jobs that already finished
        let kill_all = ctx.kill.kill_type() == KillType::All;
        let settled = self.node.checking_status == Checking::Finished;
        if settled && !kill_all {
            return Ok(());
        }

        let mut status = Checking::Finished;
        for child in &mut self.children {
            if kill_all || child.state().checking_status != Checking::Finished {
                child.kill_check(ctx, dequeue)?;
            }
            status = status.min(child.state().checking_status);
        }
        if settled {
            return Ok(());
        }

        self.node.checking_status = status;
        // Jobs stopped before they were invoked count as failed
        if status == Checking::Finished {
            self.node.result = self.aggregate(self.children.len());
        }
        Ok(())
    }

    pub(crate) fn final_status(&self, enter: &str, exit: &str) {
        let indentation = self.node.indentation();
        info!("{indentation}{enter}");
        for child in &self.children {
            child.final_status();
        }
        info!("{indentation}{exit}");
    }
}
