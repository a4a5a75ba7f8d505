//! # Jobflow
//!
//! Orchestrates builds on a CI job runner as a tree of serial and parallel
//! groups.
//!
//! Jobflow provides:
//!
//! - **Flow declaration**: Nested serial and parallel groups of job invocations
//! - **Retries**: Per-node tries bounded by a total multiplied down the tree
//! - **Result propagation**: Failures may be downgraded to unstable or ignored
//! - **Kill handling**: Stop the builds of the current run or of every job in the flow
//! - **Graph export**: A JSON node/link graph of the flow for visualization
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jobflow::prelude::*;
//!
//! let mut flow = FlowBuilder::new_serial(runner, ControllerConfig::new(), GroupOptions::new())?;
//! let root = flow.root();
//! flow.invoke(root, "build", [("branch", "main")])?;
//! flow.with_parallel(root, GroupOptions::new(), |flow, tests| {
//!     flow.invoke(tests, "unit", NO_PARAMS)?;
//!     flow.invoke(tests, "integration", NO_PARAMS)?;
//!     Ok(())
//! })?;
//! flow.invoke(root, "deploy", NO_PARAMS)?;
//!
//! let result = flow.finish()?.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod errors;
pub mod flow;
pub mod observability;
pub mod runner;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::KillSwitch;
    pub use crate::core::{BuildResult, Checking, KillType, Progress, Propagation};
    pub use crate::errors::{FlowError, JobFailure, RunnerError};
    pub use crate::flow::{
        ControllerConfig, FlowBuilder, FlowController, FlowNode, GroupOptions, GroupRef, JobRef,
    };
    pub use crate::observability::{init_tracing, GraphExporter, LogFormat};
    pub use crate::runner::{InvocationHandle, InvokeRequest, JobHandle, JobRunnerPort, JobStatus};
    pub use crate::utils::params::NO_PARAMS;
    pub use crate::utils::ParamValue;
}
