//! Endpoint selection over a group's live snapshot.
//!
//! A [`Balancer`] owns the rotation cursor and the cooldown set of one
//! listener. Both live outside the snapshot, so a snapshot replacement keeps
//! the rotation position and the failure history of endpoints that remain.

mod cooldown;
pub use cooldown::*;


use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::discovery::Snapshot;
use crate::discovery::SnapshotReader;
use crate::RoutingError;
use crate::RoutingPolicy;

/// A backend address as seen by the balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub struct Balancer {
    group: String,
    snapshots: SnapshotReader,
    policy: RoutingPolicy,
    /// Last endpoint handed out by round-robin
    cursor: ArcSwapOption<Endpoint>,
    cooldown: CooldownTracker,
    /// Highest snapshot version pruned against, plus one
    seen_version: AtomicU64,
}

impl fmt::Debug for Balancer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Balancer")
            .field("group", &self.group)
            .field("policy", &self.policy)
            .field("cursor", &self.cursor.load())
            .field("cooling", &self.cooldown.len())
            .finish()
    }
}

impl Balancer {
    pub fn new(
        group: impl Into<String>,
        snapshots: SnapshotReader,
        policy: RoutingPolicy,
        cooldown: CooldownPolicy,
    ) -> Self {
        Self {
            group: group.into(),
            snapshots,
            policy,
            cursor: ArcSwapOption::empty(),
            cooldown: CooldownTracker::new(cooldown),
            seen_version: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    pub fn select(&self) -> Result<Endpoint, RoutingError> {
        self.select_excluding(&[])
    }

    /// Picks a healthy endpoint that is not in `exclude`.
    pub fn select_excluding(
        &self,
        exclude: &[Endpoint],
    ) -> Result<Endpoint, RoutingError> {
        let snapshot = self.snapshots.load();
        self.observe(&snapshot);

        let now = Instant::now();
        let mut healthy: Vec<Endpoint> = snapshot
            .instances()
            .iter()
            .filter(|instance| instance.is_online())
            .map(|instance| instance.endpoint())
            .filter(|endpoint| !exclude.contains(endpoint) && !self.cooldown.is_cooling(endpoint, now))
            .collect();
        // Instances are sorted by (host, port), so duplicates are adjacent.
        healthy.dedup();

        if healthy.is_empty() {
            return Err(RoutingError::NoHealthyBackends {
                group: self.group.clone(),
            });
        }

        let selected = match self.policy {
            RoutingPolicy::RoundRobin => self.next_in_rotation(&healthy),
            RoutingPolicy::Random => {
                let index = rand::thread_rng().gen_range(0..healthy.len());
                healthy.swap_remove(index)
            }
        };
        trace!(group = %self.group, endpoint = %selected, "selected endpoint");
        Ok(selected)
    }

    fn next_in_rotation(
        &self,
        healthy: &[Endpoint],
    ) -> Endpoint {
        let mut selected = healthy[0].clone();
        self.cursor.rcu(|last| {
            let next = last
                .as_deref()
                .and_then(|last| healthy.iter().position(|e| e == last))
                .map_or(0, |i| (i + 1) % healthy.len());
            selected = healthy[next].clone();
            Some(Arc::new(selected.clone()))
        });
        selected
    }

    /// Puts `endpoint` into cooldown for its next consecutive failure.
    pub fn report_failure(
        &self,
        endpoint: &Endpoint,
    ) {
        let (failures, cooldown) = self.cooldown.record_failure(endpoint, Instant::now());
        debug!(
            group = %self.group,
            %endpoint,
            failures,
            ?cooldown,
            "endpoint cooling down"
        );
    }

    pub fn report_success(
        &self,
        endpoint: &Endpoint,
    ) {
        self.cooldown.record_success(endpoint);
    }

    pub fn is_cooling(
        &self,
        endpoint: &Endpoint,
    ) -> bool {
        self.cooldown.is_cooling(endpoint, Instant::now())
    }

    /// All instances of the current snapshot, cooling down or not.
    pub fn size(&self) -> usize {
        self.snapshots.load().len()
    }

    /// Instances that would be considered by `select` right now.
    pub fn healthy_count(&self) -> usize {
        let snapshot = self.snapshots.load();
        let now = Instant::now();
        let mut healthy: Vec<Endpoint> = snapshot
            .instances()
            .iter()
            .filter(|i| i.is_online())
            .map(|i| i.endpoint())
            .filter(|e| !self.cooldown.is_cooling(e, now))
            .collect();
        healthy.dedup();
        healthy.len()
    }

    /// Drops cooldown state of endpoints that left the group once a newer
    /// snapshot version shows up. A caller still holding an older snapshot
    /// never prunes.
    fn observe(
        &self,
        snapshot: &Snapshot,
    ) {
        if !snapshot.is_listed() {
            return;
        }
        // Holds the highest version observed plus one; zero means none yet.
        let mark = snapshot.version().saturating_add(1);
        if self.seen_version.fetch_max(mark, Ordering::AcqRel) >= mark {
            return;
        }
        if self.cooldown.is_empty() {
            return;
        }
        let latest = self.snapshots.load();
        self.cooldown.retain(|endpoint| {
            latest
                .instances()
                .iter()
                .any(|i| i.host == endpoint.host && i.port == endpoint.port)
        });
    }
}
