//! Alert sinks.
//!
//! The pipeline ends in a sink; production uses line-delimited JSON on
//! stdout, where the surrounding log shipper picks alerts up. Tests
//! capture alerts in memory.

use std::sync::Mutex;

use koney_core::alert::Alert;
use thiserror::Error;

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The alert could not be serialized.
    #[error("failed to serialize alert: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A destination for canonical alerts.
pub trait AlertSink: Send + Sync {
    /// Emit one alert.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the alert cannot be written.
    fn emit(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Writes alerts as JSON lines on stdout.
pub struct StdoutSink;

impl AlertSink for StdoutSink {
    fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        println!("{}", serde_json::to_string(alert)?);
        Ok(())
    }
}

/// Collects alerts in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All alerts emitted so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("sink lock poisoned").clone()
    }
}

impl AlertSink for MemorySink {
    fn emit(&self, alert: &Alert) -> Result<(), SinkError> {
        self.alerts
            .lock()
            .expect("sink lock poisoned")
            .push(alert.clone());
        Ok(())
    }
}
