//! Core domain types shared by every flow node.
//!
//! This module contains:
//! - The build result order used for worst-case aggregation
//! - Propagation, checking, progress and kill enums

mod result;
mod status;

pub use result::BuildResult;
pub use status::{Checking, KillType, Progress, Propagation};
