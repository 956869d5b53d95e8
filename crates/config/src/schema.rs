//! Configuration schema.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub dispatch: DispatchConfig,
    pub handlers: HandlersConfig,
}

/// Timeouts and fault tolerance for stage dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for a tool call when the caller passes none.
    pub tool_timeout_secs: u64,
    /// Per-handler deadline during retrieval fan-out.
    pub retrieval_timeout_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            retrieval_timeout_secs: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }
}

/// Skips a handler in the isolated stages after repeated faults. Off by
/// default: faults then only skip the handler for the call that raised them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive faults before a handler is skipped.
    pub threshold: u64,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    /// Handler names that must not be loaded.
    pub disabled: Vec<String>,
}

impl HandlersConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.iter().any(|d| d == name)
    }
}
