use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::snapshot_channel;
use super::Snapshot;
use super::SnapshotPublisher;
use super::SnapshotReader;
use crate::coordination::sort_instances;
use crate::coordination::ConnectionState;
use crate::coordination::CoordinationClient;
use crate::coordination::ServiceInstance;
use crate::metrics::ONLINE_SERVERS;
use crate::metrics::SNAPSHOT_PUBLISHES;
use crate::CoordinationError;
use crate::DiscoveryConfig;

/// Freshness of a watcher's published view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryHealth {
    Live,
    /// Serving the last known snapshot since `since`
    Stale { since: Instant },
    /// Stale for longer than the configured threshold
    Degraded { since: Instant },
}

/// Shared, read-only view of a watcher's health.
#[derive(Debug, Clone)]
pub struct WatcherStatus {
    stale_since: Arc<Mutex<Option<Instant>>>,
    degraded_after: Duration,
}

impl WatcherStatus {
    fn new(degraded_after: Duration) -> Self {
        Self {
            stale_since: Arc::new(Mutex::new(Some(Instant::now()))),
            degraded_after,
        }
    }

    pub fn health(&self) -> DiscoveryHealth {
        match *self.stale_since.lock() {
            None => DiscoveryHealth::Live,
            Some(since) if since.elapsed() >= self.degraded_after => DiscoveryHealth::Degraded { since },
            Some(since) => DiscoveryHealth::Stale { since },
        }
    }

    fn set_stale(&self) {
        self.stale_since.lock().get_or_insert_with(Instant::now);
    }

    fn clear(&self) -> Option<Instant> {
        self.stale_since.lock().take()
    }
}

enum FollowOutcome {
    Shutdown,
    Lost(String),
}

/// Keeps the snapshot of one group in step with the coordination service.
pub struct DiscoveryWatcher {
    group: String,
    client: Arc<CoordinationClient>,
    config: DiscoveryConfig,
    publisher: SnapshotPublisher,
    reader: SnapshotReader,
    status: WatcherStatus,
}

impl std::fmt::Debug for DiscoveryWatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DiscoveryWatcher")
            .field("group", &self.group)
            .field("version", &self.reader.load().listed_version())
            .finish()
    }
}

impl DiscoveryWatcher {
    pub fn new(
        group: impl Into<String>,
        client: Arc<CoordinationClient>,
        config: DiscoveryConfig,
    ) -> Self {
        let group = group.into();
        let (publisher, reader) = snapshot_channel(Snapshot::placeholder(group.clone()));
        let status = WatcherStatus::new(config.degraded_after());
        Self {
            group,
            client,
            config,
            publisher,
            reader,
            status,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn status(&self) -> WatcherStatus {
        self.status.clone()
    }

    /// Follows the group until `shutdown` fires.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<()>,
    ) {
        info!(group = %self.group, "discovery watcher started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.client.wait_connected() => {}
            }

            match self.sync_and_follow(&mut shutdown).await {
                FollowOutcome::Shutdown => break,
                FollowOutcome::Lost(reason) => self.mark_stale(&reason),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.resync_backoff()) => {}
            }
        }
        debug!(group = %self.group, "discovery watcher stopped");
    }

    /// Subscribe, list, then relist on every notification batch.
    async fn sync_and_follow(
        &mut self,
        shutdown: &mut watch::Receiver<()>,
    ) -> FollowOutcome {
        // Subscribe first so that a change racing with the listing still
        // produces a notification.
        let stream = match self.client.watch(&self.group).await {
            Ok(stream) => stream,
            Err(e) => return FollowOutcome::Lost(format!("subscribe failed: {e}")),
        };
        let mut batches = stream.ready_chunks(self.config.event_batch_size);

        if let Err(e) = self.resync().await {
            return FollowOutcome::Lost(format!("listing failed: {e}"));
        }

        let mut state_rx = self.client.subscribe_state();
        loop {
            let lost = async {
                state_rx
                    .wait_for(|s| *s == ConnectionState::Disconnected)
                    .await
                    .is_ok()
            };
            tokio::select! {
                _ = shutdown.changed() => return FollowOutcome::Shutdown,
                _ = lost => return FollowOutcome::Lost("coordination session lost".into()),
                next = batches.next() => match next {
                    None => return FollowOutcome::Lost("watch stream ended".into()),
                    Some(chunk) => {
                        let events: usize = chunk.iter().map(Vec::len).sum();
                        trace!(group = %self.group, events, "membership notification");
                        if let Err(e) = self.resync().await {
                            return FollowOutcome::Lost(format!("listing failed: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn resync(&mut self) -> Result<(), CoordinationError> {
        let members = self.client.list_members(&self.group).await?;
        self.publish_members(members);
        Ok(())
    }

    /// Publishes a new version only if the member set changed. A stale view
    /// whose members did not change is republished live under the same
    /// version.
    pub(crate) fn publish_members(
        &mut self,
        mut members: Vec<ServiceInstance>,
    ) {
        sort_instances(&mut members);
        let current = self.publisher.current();

        let next = if !current.is_listed() {
            Some(Snapshot::new(self.group.clone(), 0, members, false))
        } else if !current.same_members(&members) {
            Some(Snapshot::new(
                self.group.clone(),
                current.version() + 1,
                members,
                false,
            ))
        } else if current.is_stale() {
            Some(current.with_stale(false))
        } else {
            trace!(group = %self.group, version = current.version(), "membership unchanged");
            None
        };

        if let Some(next) = next {
            info!(
                group = %self.group,
                version = next.version(),
                instances = next.len(),
                "publishing snapshot"
            );
            self.publish(next);
        }
        if let Some(since) = self.status.clear() {
            debug!(group = %self.group, stale_for = ?since.elapsed(), "discovery live");
        }
    }

    /// Republishes the current view flagged stale, same version and members.
    pub(crate) fn mark_stale(
        &mut self,
        reason: &str,
    ) {
        self.status.set_stale();
        let current = self.publisher.current();
        if current.is_stale() {
            return;
        }
        warn!(
            group = %self.group,
            version = current.version(),
            reason,
            "serving stale snapshot"
        );
        self.publish(current.with_stale(true));
    }

    fn publish(
        &self,
        snapshot: Snapshot,
    ) {
        let stale = if snapshot.is_stale() { "true" } else { "false" };
        SNAPSHOT_PUBLISHES
            .with_label_values(&[&self.group, stale])
            .inc();
        ONLINE_SERVERS
            .with_label_values(&[&self.group])
            .set(snapshot.len() as i64);
        self.publisher.publish(snapshot);
    }
}
