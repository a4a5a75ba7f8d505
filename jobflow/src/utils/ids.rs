//! Run identifiers.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates the identifier attached to one controller run.
#[must_use]
pub fn generate_run_id() -> String {
    generate_uuid().simple().to_string()
}
