//! Log setup and run span helpers.
//!
//! Flow progress is reported through `tracing` events. Applications install a
//! subscriber once with [`init_tracing`]; the level is taken from `RUST_LOG`
//! and defaults to `info`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global subscriber.
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

/// Attributes recorded on the span of one flow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSpanAttributes {
    /// Run ID.
    pub run_id: String,
    /// Compact rendering of the flow tree.
    pub sequence: Option<String>,
    /// Number of invocations in the flow.
    pub job_count: usize,
    /// Requested kill type, if any.
    pub kill_type: Option<String>,
    /// Aggregate result once known.
    pub result: Option<String>,
}

impl FlowSpanAttributes {
    /// Creates attributes for a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Sets the flow rendering.
    #[must_use]
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Sets the number of invocations.
    #[must_use]
    pub fn with_job_count(mut self, job_count: usize) -> Self {
        self.job_count = job_count;
        self
    }

    /// Sets the kill type.
    #[must_use]
    pub fn with_kill_type(mut self, kill_type: impl Into<String>) -> Self {
        self.kill_type = Some(kill_type.into());
        self
    }

    /// Sets the result.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Flattens into dotted attribute names.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("flow.run_id".to_string(), self.run_id.clone());
        attrs.insert("flow.job_count".to_string(), self.job_count.to_string());
        if let Some(ref v) = self.sequence {
            attrs.insert("flow.sequence".to_string(), v.clone());
        }
        if let Some(ref v) = self.kill_type {
            attrs.insert("flow.kill_type".to_string(), v.clone());
        }
        if let Some(ref v) = self.result {
            attrs.insert("flow.result".to_string(), v.clone());
        }
        attrs
    }
}

/// Measures wall time of a named phase.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The phase name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns the duration in milliseconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_span_attributes() {
        let attrs = FlowSpanAttributes::new("run-1")
            .with_sequence("[a, (b, c)]")
            .with_job_count(3)
            .with_result("SUCCESS");

        let flat = attrs.to_attributes();
        assert_eq!(flat.get("flow.run_id"), Some(&"run-1".to_string()));
        assert_eq!(flat.get("flow.job_count"), Some(&"3".to_string()));
        assert_eq!(flat.get("flow.sequence"), Some(&"[a, (b, c)]".to_string()));
        assert!(!flat.contains_key("flow.kill_type"));
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("sweep");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "sweep");
        assert!(timer.finish() >= 10.0);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing(LogFormat::Pretty);
        assert!(!init_tracing(LogFormat::Json));
    }
}
