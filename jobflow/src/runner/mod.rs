//! The job runner boundary.
//!
//! Flow nodes never talk to a CI server directly. Everything they need is
//! expressed by the traits in this module, so a REST client, a local process
//! runner or the mock in [`crate::testing`] can drive the same flow.

mod ports;

pub use ports::{InvocationHandle, InvokeRequest, JobHandle, JobRunnerPort, JobStatus};
