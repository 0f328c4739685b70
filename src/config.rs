//! Tuning knobs for the sync scheduler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_check_interval_secs() -> u64 {
    10
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_early_sync_interval_secs() -> u64 {
    30
}

fn default_watchdog_secs() -> u64 {
    15
}

fn default_concurrency() -> usize {
    10
}

/// Scheduler configuration.
///
/// All fields have defaults matching the shipped behavior; embedders can
/// deserialize a partial config and only override what they need.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// How often the scheduler wakes up to evaluate `should_sync`.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Minimum elapsed time between ordinary sync passes.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Shortened interval applied after a reconnect, focus change, or an
    /// explicit trigger.
    #[serde(default = "default_early_sync_interval_secs")]
    pub early_sync_interval_secs: u64,

    /// How long a single runbook synchronizer may run before the scheduler
    /// considers the pass stuck and force-kills it.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    /// How many runbooks may reconcile with overlapping I/O.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            early_sync_interval_secs: default_early_sync_interval_secs(),
            watchdog_secs: default_watchdog_secs(),
            concurrency: default_concurrency(),
        }
    }
}

impl SyncConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn early_sync_interval(&self) -> Duration {
        Duration::from_secs(self.early_sync_interval_secs)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}
