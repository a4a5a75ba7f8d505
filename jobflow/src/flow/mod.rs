//! Flow trees: declaration, node state machines and the controller.
//!
//! A flow is declared with a [`FlowBuilder`] and run by the
//! [`FlowController`] it produces. Leaves are [`Invocation`]s of runner jobs;
//! [`SerialGroup`]s run their children in order and [`ParallelGroup`]s run
//! them at the same time.

mod builder;
mod config;
mod context;
mod controller;
mod group;
mod invocation;
mod node;
mod parallel;
mod serial;

#[cfg(test)]
mod integration_tests;

pub use builder::{FlowBuilder, GroupRef, JobRef, NodeRef};
pub use config::{ControllerConfig, GroupOptions, GRAPH_FILE_NAME};
pub use controller::FlowController;
pub use group::GroupState;
pub use invocation::Invocation;
pub use node::{FlowNode, NodeState};
pub use parallel::ParallelGroup;
pub use serial::SerialGroup;
