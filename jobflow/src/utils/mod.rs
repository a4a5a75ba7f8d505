//! Utility functions for parameters, identifiers and timestamps.

mod ids;
pub mod params;
pub mod timestamps;

pub use ids::{generate_run_id, generate_uuid};
pub use params::{display_order, job_params, mask_secrets, JobParams, ParamValue};
pub use timestamps::{elapsed_message, iso_timestamp, now_seconds, Timestamp};
