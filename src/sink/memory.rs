//! Sink holding the latest value per name, with group writes applied atomically.

use super::{TelemetrySink, TelemetryValue};
use crate::error::{AppResult, StreamError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    current: HashMap<String, TelemetryValue>,
    history: Vec<(String, TelemetryValue)>,
    fail_next: u32,
}

/// Cloneable in-memory sink. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<TelemetryValue> {
        self.state.lock().current.get(name).cloned()
    }

    /// Every accepted write, in order.
    pub fn history(&self) -> Vec<(String, TelemetryValue)> {
        self.state.lock().history.clone()
    }

    /// Values written under `name`, in order.
    pub fn history_of(&self, name: &str) -> Vec<TelemetryValue> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Reject the next `count` write calls (single or grouped).
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    fn take_failure(state: &mut MemoryState) -> AppResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StreamError::Sink("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write(&self, name: &str, value: TelemetryValue) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        state.current.insert(name.to_string(), value.clone());
        state.history.push((name.to_string(), value));
        Ok(())
    }

    async fn write_all(&self, values: Vec<(String, TelemetryValue)>) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        for (name, value) in values {
            state.current.insert(name.clone(), value.clone());
            state.history.push((name, value));
        }
        Ok(())
    }
}
