use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::Endpoint;

/// Exponential cooldown: `min(base * 2^(failures - 1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl CooldownPolicy {
    pub fn new(
        base: Duration,
        cap: Duration,
    ) -> Self {
        Self { base, cap }
    }

    pub fn duration_for(
        &self,
        consecutive_failures: u32,
    ) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    failures: u32,
    until: Instant,
}

/// Per-endpoint consecutive failure counts and cooldown deadlines.
#[derive(Debug)]
pub struct CooldownTracker {
    policy: CooldownPolicy,
    entries: DashMap<Endpoint, CooldownEntry>,
}

impl CooldownTracker {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
        }
    }

    /// Records one more consecutive failure and returns the cooldown applied.
    pub fn record_failure(
        &self,
        endpoint: &Endpoint,
        now: Instant,
    ) -> (u32, Duration) {
        let mut entry = self.entries.entry(endpoint.clone()).or_insert(CooldownEntry {
            failures: 0,
            until: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        let cooldown = self.policy.duration_for(entry.failures);
        entry.until = now + cooldown;
        (entry.failures, cooldown)
    }

    pub fn record_success(
        &self,
        endpoint: &Endpoint,
    ) {
        self.entries.remove(endpoint);
    }

    pub fn is_cooling(
        &self,
        endpoint: &Endpoint,
        now: Instant,
    ) -> bool {
        self.entries.get(endpoint).is_some_and(|entry| entry.until > now)
    }

    pub fn consecutive_failures(
        &self,
        endpoint: &Endpoint,
    ) -> u32 {
        self.entries.get(endpoint).map_or(0, |entry| entry.failures)
    }

    /// Drops entries for endpoints `keep` rejects.
    pub fn retain(
        &self,
        keep: impl Fn(&Endpoint) -> bool,
    ) {
        self.entries.retain(|endpoint, _| keep(endpoint));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
