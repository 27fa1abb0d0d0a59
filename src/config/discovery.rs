use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Pause before re-listing after a failed resync that was not a disconnect
    #[serde(default = "default_resync_backoff_ms")]
    pub resync_backoff_ms: u64,

    /// How long a watcher may serve stale data before reporting degraded health
    #[serde(default = "default_degraded_after_ms")]
    pub degraded_after_ms: u64,

    /// Upper bound on notifications coalesced into one wake-up
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            resync_backoff_ms: default_resync_backoff_ms(),
            degraded_after_ms: default_degraded_after_ms(),
            event_batch_size: default_event_batch_size(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "discovery.event_batch_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms)
    }

    pub fn degraded_after(&self) -> Duration {
        Duration::from_millis(self.degraded_after_ms)
    }
}

fn default_resync_backoff_ms() -> u64 {
    200
}
fn default_degraded_after_ms() -> u64 {
    30_000
}
fn default_event_batch_size() -> usize {
    64
}
