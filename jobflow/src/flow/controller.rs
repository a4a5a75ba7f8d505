//! The flow controller: drives a flow tree to completion.
//!
//! A run resolves every job once, then sweeps the tree until the root is no
//! longer waiting on checked work. Each sweep quick-polls the runner, checks
//! the tree and sleeps for the smaller of the poll and report intervals. Once
//! a kill is requested the controller stops checking and instead stops the
//! builds of the flow until every node has settled.

use super::config::ControllerConfig;
use super::context::{JobRegistry, RunSettings, SweepContext};
use super::node::FlowNode;
use crate::cancellation::{spawn_sigterm_listener, KillSwitch};
use crate::core::{BuildResult, Checking, KillType};
use crate::errors::FlowError;
use crate::observability::{FlowSpanAttributes, GraphExporter, SpanTimer};
use crate::runner::JobRunnerPort;
use crate::utils::{generate_run_id, iso_timestamp, now_seconds};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Runs one flow tree against a job runner.
pub struct FlowController {
    root: FlowNode,
    runner: Arc<dyn JobRunnerPort>,
    config: ControllerConfig,
    kill: Arc<KillSwitch>,
    registry: JobRegistry,
    settings: RunSettings,
    exporter: GraphExporter,
    run_id: String,
    start_time: f64,
    last_graph_time: f64,
}

impl FlowController {
    pub(crate) fn new(
        root: FlowNode,
        runner: Arc<dyn JobRunnerPort>,
        config: ControllerConfig,
        json_strip_len: usize,
    ) -> Self {
        let settings = RunSettings {
            require_idle: config.require_idle,
            cause: config.resolved_cause(),
            description: config.description.clone(),
            params_display_order: config.params_display_order.clone(),
        };
        let exporter = GraphExporter::new(config.json_indent, json_strip_len);
        Self {
            root,
            runner,
            config,
            kill: Arc::new(KillSwitch::new()),
            registry: JobRegistry::new(),
            settings,
            exporter,
            run_id: generate_run_id(),
            start_time: 0.0,
            last_graph_time: 0.0,
        }
    }

    /// The flow tree.
    #[must_use]
    pub fn root(&self) -> &FlowNode {
        &self.root
    }

    /// Consumes the controller, returning the flow tree.
    #[must_use]
    pub fn into_root(self) -> FlowNode {
        self.root
    }

    /// The aggregate result of the root group.
    #[must_use]
    pub fn result(&self) -> BuildResult {
        self.root.state().result()
    }

    /// Identifier of this run, recorded on the run span.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The switch used to kill this run from another task.
    #[must_use]
    pub fn kill_switch(&self) -> Arc<KillSwitch> {
        Arc::clone(&self.kill)
    }

    /// Renders the current flow graph.
    pub fn graph_json(&self) -> Result<String, FlowError> {
        self.exporter.to_json_string(&self.root)
    }

    /// Runs the flow.
    ///
    /// Returns the aggregate result. A failure that exhausted every retry is
    /// returned as the root's [`FlowError::Retryable`] error; any other result
    /// than `SUCCESS` fails with [`FlowError::FinalResult`] when
    /// `raise_if_unsuccessful` is set and the run was not a kill-all.
    pub async fn run(&mut self) -> Result<BuildResult, FlowError> {
        let span = info_span!("flow_run", run_id = %self.run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<BuildResult, FlowError> {
        let timer = SpanTimer::start("flow_run");
        self.write_graph()?;
        if self.config.just_dump {
            return Ok(self.result());
        }
        if self.root.children().is_empty() {
            warn!("WARNING: Empty toplevel flow {}, nothing to do.", self.root.sequence());
            return Ok(self.result());
        }

        if self.config.kill_all {
            self.kill.request(KillType::All, "Killing all running builds of jobs in flow");
        }
        let listener = if self.config.handle_sigterm {
            match spawn_sigterm_listener(Arc::clone(&self.kill)) {
                Ok(listener) => Some(listener),
                Err(err) => {
                    warn!(error = %err, "Could not install SIGTERM listener");
                    None
                }
            }
        } else {
            None
        };

        let outcome = self.drive().await;
        if let Some(listener) = listener {
            listener.abort();
        }

        let mut attributes = FlowSpanAttributes::new(&self.run_id)
            .with_sequence(self.root.sequence())
            .with_job_count(self.root.invocations().len())
            .with_result(self.result().name());
        if self.kill.is_requested() {
            attributes = attributes.with_kill_type(self.kill.kill_type().to_string());
        }
        info!(
            duration_ms = timer.finish(),
            attributes = ?attributes.to_attributes(),
            "Flow finished"
        );

        if let Err(err) = &outcome {
            warn!(error = ?err.to_dict(), "Flow failed: {err}");
        }
        let result = outcome?;
        if result != BuildResult::Success
            && self.config.raise_if_unsuccessful
            && self.kill.kill_type() != KillType::All
        {
            return Err(FlowError::FinalResult { result });
        }
        Ok(result)
    }

    async fn drive(&mut self) -> Result<BuildResult, FlowError> {
        info!("--- Getting initial job status ---");
        self.runner.poll()?;
        let kill_mode = self.kill.is_requested();
        {
            let (root, mut ctx) = self.sweep(now_seconds(), kill_mode);
            root.prepare_first(&mut ctx)?;
        }
        debug!(jobs = self.registry.len(), "Resolved job handles");
        self.root.show_job_definition(&self.settings.params_display_order);
        self.write_graph()?;

        self.start_time = now_seconds();
        self.last_graph_time = self.start_time;
        info!(started_at = %iso_timestamp(), "--- Starting flow ---");

        let sleep = self.config.sleep_interval();
        let looped = self.poll_loop(sleep).await;

        info!("--- Final status ---");
        self.root.final_status();
        let exported = self.write_graph();
        looped?;
        exported?;
        Ok(self.result())
    }

    async fn poll_loop(&mut self, sleep: Duration) -> Result<(), FlowError> {
        let kill = Arc::clone(&self.kill);
        loop {
            if kill.is_requested() {
                return self.kill_loop(sleep).await;
            }
            if self.root.state().checking_status() != Checking::MustCheck {
                return Ok(());
            }

            self.runner.quick_poll()?;
            let now = now_seconds();
            let checked = {
                let _window = kill.interruptible();
                let (root, mut ctx) = self.sweep(now, false);
                root.check(&mut ctx, false)
            };
            match checked {
                Ok(()) => {}
                Err(FlowError::Killed(reason)) => {
                    info!(reason = %reason, "Sweep interrupted by kill request");
                    continue;
                }
                Err(err) => return Err(err),
            }

            if now - self.last_graph_time >= self.config.report_interval_seconds {
                self.last_graph_time = now;
                self.write_graph()?;
            }
            tokio::time::sleep(sleep).await;
        }
    }

    async fn kill_loop(&mut self, sleep: Duration) -> Result<(), FlowError> {
        let kill_type = self.kill.kill_type();
        match kill_type {
            KillType::All => info!(kill_type = %kill_type, "Killing all builds of jobs in flow"),
            _ => info!(kill_type = %kill_type, "Got SIGTERM: Killing all builds belonging to current flow"),
        }

        loop {
            self.runner.quick_poll()?;
            self.runner.queue_poll()?;
            {
                let (root, mut ctx) = self.sweep(now_seconds(), true);
                root.kill_check(&mut ctx, true)?;
            }
            if self.root.state().checking_status() == Checking::Finished {
                return Ok(());
            }
            tokio::time::sleep(sleep).await;
        }
    }

    /// Splits the controller into the tree and the context to check it with.
    fn sweep(&mut self, now: f64, kill_mode: bool) -> (&mut FlowNode, SweepContext<'_>) {
        let ctx = SweepContext {
            runner: self.runner.as_ref(),
            registry: &mut self.registry,
            kill: &self.kill,
            settings: &self.settings,
            now,
            start_time: self.start_time,
            kill_mode,
        };
        (&mut self.root, ctx)
    }

    fn graph_dir(&self) -> Option<PathBuf> {
        self.config.json_dir.clone()
    }

    fn write_graph(&self) -> Result<(), FlowError> {
        if let Some(dir) = self.graph_dir() {
            self.exporter.write(&self.root, &dir)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("run_id", &self.run_id)
            .field("root", &self.root.sequence())
            .field("config", &self.config)
            .field("kill", &self.kill)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
