//! Live, versioned views of group membership.
//!
//! One [`DiscoveryWatcher`] per watched group lists the group, follows its
//! change notifications and publishes immutable [`Snapshot`]s. Publication is a
//! single atomic pointer swap: readers call [`SnapshotReader::load`] and never
//! observe a half-built view.

mod registry;
mod watcher;
pub use registry::*;
pub use watcher::*;

#[cfg(test)]
mod registry_test;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::coordination::sort_instances;
use crate::coordination::ServiceInstance;

/// Immutable membership view of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    group: String,
    version: u64,
    instances: Arc<[ServiceInstance]>,
    stale: bool,
    /// False only for the placeholder shown before the first listing
    listed: bool,
}

impl Snapshot {
    pub(crate) fn new(
        group: impl Into<String>,
        version: u64,
        mut instances: Vec<ServiceInstance>,
        stale: bool,
    ) -> Self {
        sort_instances(&mut instances);
        Self {
            group: group.into(),
            version,
            instances: instances.into(),
            stale,
            listed: true,
        }
    }

    /// What readers see before the first successful listing. It carries no
    /// version of its own: the first listing is version 0.
    pub fn placeholder(group: impl Into<String>) -> Self {
        Self {
            listed: false,
            ..Self::new(group, 0, Vec::new(), true)
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether this view comes from a listing of the group.
    pub fn is_listed(&self) -> bool {
        self.listed
    }

    /// The version, or `None` for the placeholder.
    pub fn listed_version(&self) -> Option<u64> {
        self.listed.then_some(self.version)
    }

    /// Instances ordered by `(host, port, registration_id)`.
    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    /// Set while the coordination service is unreachable; the instances are
    /// the last known good ones.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(crate) fn with_stale(
        &self,
        stale: bool,
    ) -> Self {
        Self {
            stale,
            ..self.clone()
        }
    }

    /// Whether `sorted` (in snapshot order) is the same member set.
    pub(crate) fn same_members(
        &self,
        sorted: &[ServiceInstance],
    ) -> bool {
        *self.instances == *sorted
    }
}

/// Write side of a snapshot cell. Owned by exactly one watcher.
#[derive(Debug)]
pub struct SnapshotPublisher {
    cell: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotPublisher {
    pub fn publish(
        &self,
        snapshot: Snapshot,
    ) {
        debug_assert!(snapshot.version >= self.cell.load().version);
        self.cell.store(Arc::new(snapshot));
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.cell.load_full()
    }
}

/// Read side of a snapshot cell. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    cell: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotReader {
    pub fn load(&self) -> Arc<Snapshot> {
        self.cell.load_full()
    }
}

pub fn snapshot_channel(initial: Snapshot) -> (SnapshotPublisher, SnapshotReader) {
    let cell = Arc::new(ArcSwap::from_pointee(initial));
    (
        SnapshotPublisher { cell: cell.clone() },
        SnapshotReader { cell },
    )
}
