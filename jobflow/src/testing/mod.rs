//! Testing utilities for jobflow flows.
//!
//! This module provides:
//! - A tick-based in-memory job runner
//! - Assertions over finished flows and runner history

mod assertions;
mod mocks;

pub use assertions::{assert_invocations, assert_job_result, assert_ran_before};
pub use mocks::{MockInvocation, MockJob, MockJobHandle, MockJobRunner};
