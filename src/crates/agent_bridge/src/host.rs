use std::collections::BTreeMap;

use crate::error::{BridgeError, BridgeResult};

/// What the bridge needs from the simulation hosting it.
///
/// State access is by name so the bridge never depends on how the host stores
/// its variables. Diagnostics go to the host's own error and trace channels.
pub trait HostContext {
    /// Current value of a named state, or `None` if the host has no such state.
    fn read_state(&self, name: &str) -> Option<f64>;

    /// Assign a named state.
    fn write_state(&mut self, name: &str, value: f64) -> BridgeResult<()>;

    /// Surface a non-fatal error to the operator.
    fn report_error(&mut self, message: &str);

    /// Record an informational trace line.
    fn trace(&mut self, message: &str);
}

/// Host backed by an in-memory map. Useful for headless runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    states: BTreeMap<String, f64>,
    errors: Vec<String>,
    traces: Vec<String>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state value.
    pub fn with_state(mut self, name: impl Into<String>, value: f64) -> Self {
        self.states.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.states.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.states.get(name).copied()
    }

    /// Errors reported so far, oldest first.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Trace lines recorded so far, oldest first.
    pub fn traces(&self) -> &[String] {
        &self.traces
    }

    /// Forget collected diagnostics while keeping state values.
    pub fn clear_diagnostics(&mut self) {
        self.errors.clear();
        self.traces.clear();
    }
}

impl HostContext for MemoryHost {
    fn read_state(&self, name: &str) -> Option<f64> {
        self.get(name)
    }

    fn write_state(&mut self, name: &str, value: f64) -> BridgeResult<()> {
        match self.states.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(BridgeError::state_write(name, "state is not declared")),
        }
    }

    fn report_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    fn trace(&mut self, message: &str) {
        self.traces.push(message.to_string());
    }
}
