//! Polling cadence and bounds shared by the deployer, waiter and pipeline steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling periods and timeouts.
///
/// Serialized as plain integers so it can live in a TOML configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployTimings {
    /// Period between change set describe calls while it is being computed.
    pub change_set_poll_ms: u64,
    /// Period between stack describe calls while a deployment runs.
    pub stack_poll_ms: u64,
    /// Period between reads of an external process log.
    pub log_poll_ms: u64,
    /// Overall bound on an external build or push process.
    pub log_timeout_secs: u64,
    /// Overall bound on a remote resource becoming ready.
    pub resource_timeout_secs: u64,
}

impl Default for DeployTimings {
    fn default() -> Self {
        Self {
            change_set_poll_ms: 1_000,
            stack_poll_ms: 5_000,
            log_poll_ms: 5_000,
            log_timeout_secs: 10 * 60,
            resource_timeout_secs: 30 * 60,
        }
    }
}

impl DeployTimings {
    pub fn change_set_poll(&self) -> Duration {
        Duration::from_millis(self.change_set_poll_ms)
    }

    pub fn stack_poll(&self) -> Duration {
        Duration::from_millis(self.stack_poll_ms)
    }

    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    /// Millisecond-scale timings for tests and local dry runs.
    pub fn fast() -> Self {
        Self {
            change_set_poll_ms: 1,
            stack_poll_ms: 1,
            log_poll_ms: 5,
            log_timeout_secs: 2,
            resource_timeout_secs: 2,
        }
    }
}
