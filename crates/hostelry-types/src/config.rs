//! Engine configuration types for Hostelry.
//!
//! `EngineConfig` is the `[engine]` table of `config.toml`. Every field has a
//! default so a partial (or missing) file still yields a usable engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Runtime settings for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to steps that do not set their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Timeout for each pre-execution validator.
    #[serde(default = "default_validator_timeout_secs")]
    pub validator_timeout_secs: u64,

    /// Timeout for each lifecycle hook invocation.
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,

    /// Stored executions above which terminal ones are evicted.
    #[serde(default = "default_max_execution_history")]
    pub max_execution_history: usize,

    /// Interval of the housekeeping (eviction) loop.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Write terminal snapshots to the key-value store, if one is attached.
    #[serde(default = "default_enable_persistence")]
    pub enable_persistence: bool,

    /// Expiry of persisted snapshots.
    #[serde(default = "default_persistence_ttl_secs")]
    pub persistence_ttl_secs: u64,

    /// Size of the blocking worker pool offered to handlers.
    #[serde(default = "default_max_blocking_workers")]
    pub max_blocking_workers: usize,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_validator_timeout_secs() -> u64 {
    30
}

fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_max_execution_history() -> usize {
    1000
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_enable_persistence() -> bool {
    true
}

fn default_persistence_ttl_secs() -> u64 {
    86_400
}

fn default_max_blocking_workers() -> usize {
    10
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_secs(self.validator_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn persistence_ttl(&self) -> Duration {
        Duration::from_secs(self.persistence_ttl_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            validator_timeout_secs: default_validator_timeout_secs(),
            hook_timeout_secs: default_hook_timeout_secs(),
            max_execution_history: default_max_execution_history(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            enable_persistence: default_enable_persistence(),
            persistence_ttl_secs: default_persistence_ttl_secs(),
            max_blocking_workers: default_max_blocking_workers(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}
