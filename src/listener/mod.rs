//! Static listener registry and the per-listener online server index.
//!
//! The [`ListenerMetaIndex`] is built once from configuration and never
//! mutated afterwards; it is shared by reference between the proxy servers,
//! the forwarding engine and the status surface.


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::Balancer;
use crate::balancer::CooldownPolicy;
use crate::discovery::DiscoveryRegistry;
use crate::discovery::Snapshot;
use crate::discovery::SnapshotReader;
use crate::BackendKind;
use crate::Error;
use crate::ListenerConfig;
use crate::Result;
use crate::RoutingPolicy;

/// Immutable description of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerMeta {
    pub listen_address: String,
    pub target_group: String,
    pub routing_policy: RoutingPolicy,
    pub retry_budget: u32,
    pub cooldown_base: Duration,
    pub cooldown_cap: Duration,
    pub retry_non_idempotent: bool,
    pub backend_kind: BackendKind,
}

impl From<&ListenerConfig> for ListenerMeta {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            listen_address: config.listen_address.clone(),
            target_group: config.target_group_name.clone(),
            routing_policy: config.routing_policy,
            retry_budget: config.retry_budget,
            cooldown_base: config.cooldown_base(),
            cooldown_cap: config.cooldown_cap(),
            retry_non_idempotent: config.retry_non_idempotent,
            backend_kind: config.backend_kind,
        }
    }
}

/// The live snapshot of a listener's target group plus its balancer.
#[derive(Debug)]
pub struct OnlineServerIndex {
    snapshots: SnapshotReader,
    balancer: Balancer,
}

impl OnlineServerIndex {
    pub fn new(
        meta: &ListenerMeta,
        snapshots: SnapshotReader,
    ) -> Self {
        let balancer = Balancer::new(
            meta.target_group.clone(),
            snapshots.clone(),
            meta.routing_policy,
            CooldownPolicy::new(meta.cooldown_base, meta.cooldown_cap),
        );
        Self { snapshots, balancer }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshots.load()
    }

    pub fn size(&self) -> usize {
        self.current().len()
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }
}

#[derive(Debug)]
pub struct ListenerEntry {
    pub meta: ListenerMeta,
    pub servers: OnlineServerIndex,
}

/// Listen address -> (listener meta, online server index).
#[derive(Debug, Default)]
pub struct ListenerMetaIndex {
    entries: BTreeMap<String, ListenerEntry>,
}

impl ListenerMetaIndex {
    /// Builds the index, wiring every listener to the watcher of its group.
    /// Listeners that target the same group share one watcher.
    pub fn build(
        configs: &[ListenerConfig],
        discovery: &mut DiscoveryRegistry,
    ) -> Result<Self> {
        Self::build_with(configs, |group| discovery.reader(group))
    }

    /// Same as [`Self::build`] with an arbitrary snapshot source per group.
    pub(crate) fn build_with(
        configs: &[ListenerConfig],
        mut reader_for: impl FnMut(&str) -> SnapshotReader,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for config in configs {
            config.validate()?;
            let meta = ListenerMeta::from(config);
            let servers = OnlineServerIndex::new(&meta, reader_for(&meta.target_group));
            if entries
                .insert(meta.listen_address.clone(), ListenerEntry { meta, servers })
                .is_some()
            {
                return Err(Error::InvalidConfig(format!(
                    "duplicate listener address {}",
                    config.listen_address
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(
        &self,
        listen_address: &str,
    ) -> Option<&ListenerEntry> {
        self.entries.get(listen_address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
