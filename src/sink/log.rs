//! Sink that turns every write into a tracing event.
//!
//! Default sink for the binary: the wire protocol that exposes values to live consumers
//! is provided elsewhere, and this keeps the stream observable in the logs.

use super::{TelemetrySink, TelemetryValue};
use crate::error::AppResult;
use async_trait::async_trait;
use tracing::{debug, trace};

/// Logs values under the `telemetry` target.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    verbose: bool,
}

impl LogSink {
    /// Sink logging array summaries at debug level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log full array contents at trace level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[async_trait]
impl TelemetrySink for LogSink {
    async fn write(&self, name: &str, value: TelemetryValue) -> AppResult<()> {
        match &value {
            TelemetryValue::FloatArray(values) if self.verbose => {
                trace!(target: "telemetry", name, ?values, "write");
            }
            _ => debug!(target: "telemetry", name, value = %value, "write"),
        }
        Ok(())
    }
}
