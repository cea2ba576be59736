//! Telemetry sinks: where published values go.
//!
//! The transport that exposes values to consumers is out of scope; a sink only has to
//! accept named writes. A tick publishes its values through one [`TelemetrySink::write_all`]
//! call, so sinks that can apply a group atomically never expose half a batch.

pub mod log;
pub mod memory;

pub use self::log::LogSink;
pub use memory::MemorySink;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Value types a sink accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Integer scalar (indices, counts)
    Int(i64),
    /// Floating-point scalar (timestamps)
    Float(f64),
    /// Text scalar (names, labels)
    Text(String),
    /// Floating-point array (axis batches)
    FloatArray(Vec<f64>),
}

impl TelemetryValue {
    /// Integer scalar from an unsigned count, saturating at `i64::MAX`.
    pub fn count(value: usize) -> Self {
        TelemetryValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for TelemetryValue {
    fn from(value: &str) -> Self {
        TelemetryValue::Text(value.to_string())
    }
}

impl From<String> for TelemetryValue {
    fn from(value: String) -> Self {
        TelemetryValue::Text(value)
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Float(value)
    }
}

impl From<Vec<f64>> for TelemetryValue {
    fn from(value: Vec<f64>) -> Self {
        TelemetryValue::FloatArray(value)
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Int(v) => write!(f, "{v}"),
            TelemetryValue::Float(v) => write!(f, "{v}"),
            TelemetryValue::Text(v) => f.write_str(v),
            TelemetryValue::FloatArray(v) => write!(f, "[{} values]", v.len()),
        }
    }
}

/// Destination for published values.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Write one named value.
    async fn write(&self, name: &str, value: TelemetryValue) -> AppResult<()>;

    /// Write a group of values that belong to one tick.
    ///
    /// The default writes them in order and stops at the first failure.
    async fn write_all(&self, values: Vec<(String, TelemetryValue)>) -> AppResult<()> {
        for (name, value) in values {
            self.write(&name, value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: TelemetrySink + ?Sized> TelemetrySink for std::sync::Arc<S> {
    async fn write(&self, name: &str, value: TelemetryValue) -> AppResult<()> {
        (**self).write(name, value).await
    }

    async fn write_all(&self, values: Vec<(String, TelemetryValue)>) -> AppResult<()> {
        (**self).write_all(values).await
    }
}
