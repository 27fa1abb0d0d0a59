use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::DiscoveryHealth;
use super::DiscoveryWatcher;
use super::SnapshotReader;
use super::WatcherStatus;
use crate::coordination::CoordinationClient;
use crate::DiscoveryConfig;

struct GroupEntry {
    reader: SnapshotReader,
    status: WatcherStatus,
    /// Taken when the watcher is spawned
    watcher: Option<DiscoveryWatcher>,
}

/// One discovery watcher per distinct group, shared by every listener that
/// targets the group.
pub struct DiscoveryRegistry {
    client: Arc<CoordinationClient>,
    config: DiscoveryConfig,
    groups: BTreeMap<String, GroupEntry>,
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DiscoveryRegistry")
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DiscoveryRegistry {
    pub fn new(
        client: Arc<CoordinationClient>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            client,
            config,
            groups: BTreeMap::new(),
        }
    }

    /// Reader for `group`, creating its watcher on first use.
    pub fn reader(
        &mut self,
        group: &str,
    ) -> SnapshotReader {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| {
                let watcher = DiscoveryWatcher::new(group, self.client.clone(), self.config.clone());
                GroupEntry {
                    reader: watcher.reader(),
                    status: watcher.status(),
                    watcher: Some(watcher),
                }
            })
            .reader
            .clone()
    }

    pub fn status(
        &self,
        group: &str,
    ) -> Option<WatcherStatus> {
        self.groups.get(group).map(|entry| entry.status.clone())
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn statuses(&self) -> Vec<(String, WatcherStatus)> {
        self.groups
            .iter()
            .map(|(group, entry)| (group.clone(), entry.status.clone()))
            .collect()
    }

    pub fn health(&self) -> Vec<(String, DiscoveryHealth)> {
        self.groups
            .iter()
            .map(|(group, entry)| (group.clone(), entry.status.health()))
            .collect()
    }

    /// Starts every watcher not yet running.
    pub fn spawn(
        &mut self,
        shutdown: watch::Receiver<()>,
    ) -> Vec<JoinHandle<()>> {
        self.groups
            .values_mut()
            .filter_map(|entry| entry.watcher.take())
            .map(|watcher| tokio::spawn(watcher.run(shutdown.clone())))
            .collect()
    }
}
