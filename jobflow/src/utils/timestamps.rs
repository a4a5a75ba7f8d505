//! Wall-clock helpers.
//!
//! Flow timing is kept as `f64` seconds since the Unix epoch. `0.0` means
//! "not started" for invocation times.

use chrono::{DateTime, TimeZone, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use jobflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Returns the current time in seconds since the Unix epoch.
#[must_use]
pub fn now_seconds() -> f64 {
    to_seconds(&Utc::now())
}

/// Converts a timestamp to fractional seconds since the Unix epoch.
#[must_use]
pub fn to_seconds(dt: &Timestamp) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let micros = dt.timestamp_micros() as f64;
    micros / 1_000_000.0
}

/// Converts fractional seconds since the Unix epoch back to a timestamp.
#[must_use]
pub fn from_seconds(seconds: f64) -> Option<Timestamp> {
    #[allow(clippy::cast_possible_truncation)]
    let micros = (seconds * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros).single()
}

/// Formats a timestamp as ISO 8601 string.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Formats the "after: x/y" elapsed message.
///
/// `x` is the time spent in the current attempt of a node, `y` the time
/// since the outermost flow started.
#[must_use]
pub fn elapsed_message(now: f64, invocation_time: f64, start_time: f64) -> String {
    format!("after: {:.3}s/{:.3}s", now - invocation_time, now - start_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }

    #[test]
    fn test_seconds_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2023, 10, 5, 14, 30, 0).unwrap();
        let secs = to_seconds(&dt);
        assert!((secs - 1_696_516_200.0).abs() < 1e-6);
        assert_eq!(from_seconds(secs), Some(dt));
    }

    #[test]
    fn test_now_seconds_is_recent() {
        assert!(now_seconds() > 1_696_516_200.0);
    }

    #[test]
    fn test_elapsed_message() {
        assert_eq!(elapsed_message(12.5, 10.0, 2.0), "after: 2.500s/10.500s");
    }
}
