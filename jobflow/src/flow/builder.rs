//! Builder for flow trees.
//!
//! Groups are opened with [`FlowBuilder::serial`] or [`FlowBuilder::parallel`]
//! and must be closed with [`FlowBuilder::end`] in reverse order. Only the
//! innermost open group accepts new children. The closure forms
//! [`FlowBuilder::with_serial`] and [`FlowBuilder::with_parallel`] close the
//! group on every path.

use super::config::{ControllerConfig, GroupOptions};
use super::controller::FlowController;
use super::group::GroupState;
use super::invocation::Invocation;
use super::node::{FlowNode, NodeState};
use super::parallel::ParallelGroup;
use super::serial::SerialGroup;
use crate::core::Propagation;
use crate::errors::{FlowError, FlowScopeError, MessageRedefinedError};
use crate::runner::JobRunnerPort;
use crate::utils::params::secret_params_regex;
use crate::utils::{job_params, ParamValue};
use regex::Regex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Handle to a group declared in a [`FlowBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupRef {
    node_id: usize,
    nesting_level: i32,
}

impl GroupRef {
    /// The group's node id.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// The group's depth; the root is 0.
    #[must_use]
    pub fn nesting_level(&self) -> i32 {
        self.nesting_level
    }
}

/// Handle to an invocation declared in a [`FlowBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobRef {
    node_id: usize,
}

impl JobRef {
    /// The invocation's node id.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.node_id
    }
}

/// Any node that can carry a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(usize);

impl From<GroupRef> for NodeRef {
    fn from(group: GroupRef) -> Self {
        Self(group.node_id)
    }
}

impl From<JobRef> for NodeRef {
    fn from(job: JobRef) -> Self {
        Self(job.node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Serial,
    Parallel,
}

/// A group that is still accepting children.
#[derive(Debug)]
struct OpenGroup {
    kind: GroupKind,
    group: GroupState,
    security_token: Option<String>,
    secret_params: Regex,
    allow_missing_jobs: bool,
}

impl OpenGroup {
    fn into_node(self) -> FlowNode {
        match self.kind {
            GroupKind::Serial => FlowNode::Serial(SerialGroup {
                group: self.group,
                job_index: 0,
            }),
            GroupKind::Parallel => FlowNode::Parallel(ParallelGroup {
                group: self.group,
                failed_children: BTreeMap::new(),
            }),
        }
    }

    fn enter_str(&self) -> &'static str {
        match self.kind {
            GroupKind::Serial => SerialGroup::ENTER,
            GroupKind::Parallel => ParallelGroup::ENTER,
        }
    }

    fn exit_str(&self) -> &'static str {
        match self.kind {
            GroupKind::Serial => SerialGroup::EXIT,
            GroupKind::Parallel => ParallelGroup::EXIT,
        }
    }
}

/// Declares a flow tree and turns it into a [`FlowController`].
pub struct FlowBuilder {
    runner: Arc<dyn JobRunnerPort>,
    config: ControllerConfig,
    root: GroupRef,
    open: Vec<OpenGroup>,
    next_node_id: usize,
    current_nesting_level: i32,
    messages: BTreeMap<usize, String>,
    invocation_counts: HashMap<String, usize>,
    json_strip_len: usize,
}

impl FlowBuilder {
    /// Starts a flow whose root runs its children in order.
    pub fn new_serial(
        runner: Arc<dyn JobRunnerPort>,
        config: ControllerConfig,
        options: GroupOptions,
    ) -> Result<Self, FlowError> {
        Self::new(runner, config, options, GroupKind::Serial)
    }

    /// Starts a flow whose root runs its children at the same time.
    pub fn new_parallel(
        runner: Arc<dyn JobRunnerPort>,
        config: ControllerConfig,
        options: GroupOptions,
    ) -> Result<Self, FlowError> {
        Self::new(runner, config, options, GroupKind::Parallel)
    }

    fn new(
        runner: Arc<dyn JobRunnerPort>,
        config: ControllerConfig,
        options: GroupOptions,
        kind: GroupKind,
    ) -> Result<Self, FlowError> {
        config.validate()?;
        let pattern = options.secret_params.as_deref().unwrap_or(&config.secret_params);
        let secret_params = secret_params_regex(pattern)?;
        let json_strip_len = if config.json_strip_top_level_prefix {
            options.job_name_prefix.len()
        } else {
            0
        };

        let root_group = OpenGroup {
            kind,
            group: GroupState {
                node: NodeState::new(
                    0,
                    0,
                    options.max_tries,
                    options.max_tries,
                    options.propagation.unwrap_or(Propagation::Normal),
                ),
                children: Vec::new(),
                timeout: options.timeout_seconds,
                report_interval: options
                    .report_interval_seconds
                    .unwrap_or(config.report_interval_seconds),
                last_report_time: 0.0,
                job_name_prefix: options.job_name_prefix,
                aborted: false,
            },
            security_token: options.security_token.or_else(|| config.security_token.clone()),
            secret_params,
            allow_missing_jobs: options.allow_missing_jobs.unwrap_or(config.allow_missing_jobs),
        };
        log_legend();
        info!("{}", root_group.enter_str());

        Ok(Self {
            runner,
            config,
            root: GroupRef {
                node_id: 0,
                nesting_level: 0,
            },
            open: vec![root_group],
            next_node_id: 1,
            current_nesting_level: 0,
            messages: BTreeMap::new(),
            invocation_counts: HashMap::new(),
            json_strip_len,
        })
    }

    /// The root group.
    #[must_use]
    pub fn root(&self) -> GroupRef {
        self.root
    }

    /// Nesting level of the innermost open group.
    #[must_use]
    pub fn current_nesting_level(&self) -> i32 {
        self.current_nesting_level
    }

    /// Opens a serial group inside `parent`.
    pub fn serial(&mut self, parent: GroupRef, options: GroupOptions) -> Result<GroupRef, FlowError> {
        self.open_group(parent, options, GroupKind::Serial)
    }

    /// Opens a parallel group inside `parent`.
    pub fn parallel(&mut self, parent: GroupRef, options: GroupOptions) -> Result<GroupRef, FlowError> {
        self.open_group(parent, options, GroupKind::Parallel)
    }

    /// Opens a serial group, runs `body` in it and closes it.
    pub fn with_serial<F>(&mut self, parent: GroupRef, options: GroupOptions, body: F) -> Result<GroupRef, FlowError>
    where
        F: FnOnce(&mut Self, GroupRef) -> Result<(), FlowError>,
    {
        let group = self.serial(parent, options)?;
        self.run_scoped(group, body)
    }

    /// Opens a parallel group, runs `body` in it and closes it.
    pub fn with_parallel<F>(&mut self, parent: GroupRef, options: GroupOptions, body: F) -> Result<GroupRef, FlowError>
    where
        F: FnOnce(&mut Self, GroupRef) -> Result<(), FlowError>,
    {
        let group = self.parallel(parent, options)?;
        self.run_scoped(group, body)
    }

    fn run_scoped<F>(&mut self, group: GroupRef, body: F) -> Result<GroupRef, FlowError>
    where
        F: FnOnce(&mut Self, GroupRef) -> Result<(), FlowError>,
    {
        match body(self, group) {
            Ok(()) => {
                self.end(group)?;
                Ok(group)
            }
            Err(err) => {
                self.discard(group);
                Err(err)
            }
        }
    }

    /// Closes `group`. An empty group is dropped from the tree.
    pub fn end(&mut self, group: GroupRef) -> Result<(), FlowError> {
        if group == self.root {
            return Err(self.scope_error("The top level flow is closed by finish", group.nesting_level));
        }
        self.check_innermost(group)?;

        let Some(closed) = self.open.pop() else {
            return Err(self.scope_error("Flow used out of scope", group.nesting_level));
        };
        self.current_nesting_level -= 1;

        let indentation = closed.group.node.indentation();
        info!("{indentation}{}", closed.exit_str());
        if closed.group.children.is_empty() {
            info!("{indentation}INFO: Ignoring empty flow");
            return Ok(());
        }
        if let Some(parent) = self.open.last_mut() {
            parent.group.children.push(closed.into_node());
        }
        Ok(())
    }

    /// Declares an invocation of `job_name` in `group`.
    pub fn invoke<I, K, V>(&mut self, group: GroupRef, job_name: &str, params: I) -> Result<JobRef, FlowError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.add_invocation(group, job_name, params, None)
    }

    /// Declares an invocation that never fails the flow.
    ///
    /// The job runs alongside the following siblings even in a serial group,
    /// and is left running when every checked job has finished.
    pub fn invoke_unchecked<I, K, V>(&mut self, group: GroupRef, job_name: &str, params: I) -> Result<JobRef, FlowError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.add_invocation(group, job_name, params, Some(Propagation::Unchecked))
    }

    /// Sets the message printed before `node` is invoked. A message can only
    /// be set once.
    pub fn message(&mut self, node: impl Into<NodeRef>, message: impl Into<String>) -> Result<(), FlowError> {
        let NodeRef(node_id) = node.into();
        let message = message.into();
        match self.messages.entry(node_id) {
            Entry::Occupied(existing) => Err(MessageRedefinedError {
                existing: existing.get().clone(),
                new: message,
            }
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(message);
                Ok(())
            }
        }
    }

    /// Closes the root and hands the tree to a controller.
    pub fn finish(mut self) -> Result<FlowController, FlowError> {
        if self.open.len() != 1 {
            let level = self.current_nesting_level;
            return Err(self.scope_error("Flow finished with unclosed groups", level));
        }
        let Some(root) = self.open.pop() else {
            return Err(self.scope_error("Flow used out of scope", 0));
        };
        info!("{}", root.exit_str());

        let mut root = root.into_node();
        apply_messages(&mut root, &mut self.messages);
        Ok(FlowController::new(root, self.runner, self.config, self.json_strip_len))
    }

    fn open_group(&mut self, parent: GroupRef, options: GroupOptions, kind: GroupKind) -> Result<GroupRef, FlowError> {
        let nesting_level = parent.nesting_level + 1;
        self.check_scope(parent, nesting_level)?;
        let parent_group = self.innermost()?;

        let pattern = options.secret_params.as_deref();
        let secret_params = match pattern {
            Some(pattern) => secret_params_regex(pattern)?,
            None => parent_group.secret_params.clone(),
        };
        let parent_total = parent_group.group.node.total_max_tries;
        let Some(total_max_tries) = options.max_tries.checked_mul(parent_total) else {
            return Err(FlowError::Config(format!(
                "max_tries {} nested under {parent_total} total tries overflows",
                options.max_tries
            )));
        };
        let node_id = self.next_node_id;

        let open = OpenGroup {
            kind,
            group: GroupState {
                node: NodeState::new(
                    node_id,
                    nesting_level,
                    options.max_tries,
                    total_max_tries,
                    options.propagation.unwrap_or(parent_group.group.node.propagation),
                ),
                children: Vec::new(),
                timeout: options.timeout_seconds,
                report_interval: options
                    .report_interval_seconds
                    .unwrap_or(parent_group.group.report_interval),
                last_report_time: 0.0,
                job_name_prefix: format!("{}{}", parent_group.group.job_name_prefix, options.job_name_prefix),
                aborted: false,
            },
            security_token: options
                .security_token
                .or_else(|| parent_group.security_token.clone()),
            secret_params,
            allow_missing_jobs: options.allow_missing_jobs.unwrap_or(parent_group.allow_missing_jobs),
        };

        info!("{}{}", open.group.node.indentation(), open.enter_str());
        self.next_node_id += 1;
        self.current_nesting_level += 1;
        self.open.push(open);
        Ok(GroupRef {
            node_id,
            nesting_level,
        })
    }

    fn add_invocation<I, K, V>(
        &mut self,
        group: GroupRef,
        job_name: &str,
        params: I,
        propagation: Option<Propagation>,
    ) -> Result<JobRef, FlowError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let nesting_level = group.nesting_level + 1;
        self.check_scope(group, nesting_level)?;

        let node_id = self.next_node_id;
        let parent = self.innermost()?;
        let name = format!("{}{job_name}", parent.group.job_name_prefix);
        let node = &parent.group.node;
        let state = NodeState::new(
            node_id,
            nesting_level,
            node.max_tries,
            node.total_max_tries,
            propagation.unwrap_or(node.propagation),
        );
        let security_token = parent.security_token.clone();
        let secret_params = parent.secret_params.clone();
        let allow_missing_jobs = parent.allow_missing_jobs;

        let count = self.invocation_counts.entry(name.clone()).or_insert(0);
        *count += 1;
        let invocation = Invocation {
            state,
            name,
            params: job_params(params),
            security_token,
            allow_missing_jobs,
            secret_params,
            invocation_number: *count,
            job: None,
            invocation: None,
            old_build_number: None,
            stop_sent: false,
        };
        debug!(job = %invocation.name, "{}{}", invocation.state.indentation(), invocation.sequence());

        self.next_node_id += 1;
        if let Some(parent) = self.open.last_mut() {
            parent.group.children.push(FlowNode::Invocation(invocation));
        }
        Ok(JobRef { node_id })
    }

    /// Fails unless a node at `nesting_level` may be added to `group` now.
    fn check_scope(&self, group: GroupRef, nesting_level: i32) -> Result<(), FlowError> {
        if nesting_level != self.current_nesting_level + 1 {
            return Err(self.scope_error("Flow used out of scope", nesting_level));
        }
        self.check_innermost(group)
    }

    fn check_innermost(&self, group: GroupRef) -> Result<(), FlowError> {
        match self.open.last() {
            Some(open) if open.group.node.node_id == group.node_id => Ok(()),
            _ => Err(self.scope_error("Flow used out of scope", group.nesting_level)),
        }
    }

    fn innermost(&self) -> Result<&OpenGroup, FlowError> {
        self.open
            .last()
            .ok_or_else(|| self.scope_error("Flow used out of scope", self.current_nesting_level + 1))
    }

    fn discard(&mut self, group: GroupRef) {
        if self.open.len() > 1 && self.check_innermost(group).is_ok() {
            self.open.pop();
            self.current_nesting_level -= 1;
        }
    }

    fn scope_error(&self, message: &str, nesting_level: i32) -> FlowError {
        FlowScopeError::new(message)
            .with_levels(nesting_level, self.current_nesting_level)
            .into()
    }
}

impl std::fmt::Debug for FlowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowBuilder")
            .field("open", &self.open.len())
            .field("current_nesting_level", &self.current_nesting_level)
            .field("next_node_id", &self.next_node_id)
            .finish_non_exhaustive()
    }
}

fn log_legend() {
    info!("=== Jobflow ===");
    info!("Legend:");
    info!("Serial builds: []");
    info!("Parallel builds: ()");
    info!(
        "Invoking (w/x,y/z): w=current invocation in current flow scope, x=max in scope, \
         y=total number of invocations, z=total max invocations"
    );
    info!(
        "Elapsed time: 'after: x/y': x=time spent during current run of job, \
         y=time elapsed since start of outermost flow"
    );
    info!("--- Calculating flow graph ---");
}

fn apply_messages(node: &mut FlowNode, messages: &mut BTreeMap<usize, String>) {
    if let Some(message) = messages.remove(&node.state().node_id) {
        node.state_mut().message = Some(message);
    }
    let children = match node {
        FlowNode::Invocation(_) => return,
        FlowNode::Serial(serial) => &mut serial.group.children,
        FlowNode::Parallel(parallel) => &mut parallel.group.children,
    };
    for child in children {
        apply_messages(child, messages);
    }
}
