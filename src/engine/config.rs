//! Executive configuration
//!
//! ```yaml
//! max_steps_per_cycle: 10000
//! abort_timeout_ms: 2000
//! idle_wait_ms: 1000
//! allow_duplicate_messages: false
//! time_state: time
//! queue_capacity: 64
//! ```
//!
//! Every field has a default, so an empty document is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ExecError, ExecResult};

/// Tunables for [`Exec`](crate::engine::exec::Exec) and the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Micro-steps allowed before a quiescence loop is declared runaway
    pub max_steps_per_cycle: usize,

    /// How long shutdown waits for abort acknowledgements
    pub abort_timeout_ms: u64,

    /// Longest single blocking wait of the exec thread
    pub idle_wait_ms: u64,

    /// Keep every received message instead of only the newest per name
    pub allow_duplicate_messages: bool,

    /// State read as the clock
    pub time_state: String,

    /// Queue slots allocated up front
    pub queue_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_steps_per_cycle: 10_000,
            abort_timeout_ms: 2_000,
            idle_wait_ms: 1_000,
            allow_duplicate_messages: false,
            time_state: "time".to_string(),
            queue_capacity: 64,
        }
    }
}

impl ExecConfig {
    pub fn from_yaml(yaml: &str) -> ExecResult<Self> {
        let config: ExecConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ExecResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> ExecResult<()> {
        if self.max_steps_per_cycle == 0 {
            return Err(ExecError::InvalidConfig(
                "max_steps_per_cycle must be positive".to_string(),
            ));
        }
        if self.idle_wait_ms == 0 {
            return Err(ExecError::InvalidConfig(
                "idle_wait_ms must be positive".to_string(),
            ));
        }
        if self.time_state.is_empty() {
            return Err(ExecError::InvalidConfig(
                "time_state must name a state".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps_per_cycle = steps;
        self
    }

    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_duplicate_messages(mut self, allow: bool) -> Self {
        self.allow_duplicate_messages = allow;
        self
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}
