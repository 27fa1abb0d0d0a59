//! In-process coordination service.
//!
//! [`MemoryCoordinator`] keeps lease-backed group membership and a short,
//! revisioned change log per group. Leases are expired lazily on every access
//! and by a reaper task. Every change bumps the group revision, is appended to
//! the log (used by long-poll watches) and is broadcast to live subscribers.
//!
//! [`MemorySession`] is one client connection to a coordinator. It can be
//! partitioned to simulate losing the coordination service.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::sort_instances;
use super::validate_group;
use super::CoordinationBackend;
use super::CoordinationResult;
use super::EventKind;
use super::InstanceState;
use super::MembershipEvent;
use super::RegistrationId;
use super::ServiceInstance;
use super::WatchStream;
use crate::CoordinationError;

/// Number of events kept per group for long-poll watches.
pub const EVENT_LOG_CAPACITY: usize = 256;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Lease {
    instance: ServiceInstance,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct GroupLog {
    revision: u64,
    log: VecDeque<(u64, MembershipEvent)>,
    tx: broadcast::Sender<MembershipEvent>,
}

impl GroupLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            revision: 0,
            log: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
            tx,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    leases: HashMap<RegistrationId, Lease>,
    groups: HashMap<String, GroupLog>,
}

impl State {
    fn emit(
        &mut self,
        kind: EventKind,
        instance: ServiceInstance,
    ) {
        let group = self.groups.entry(instance.group.clone()).or_insert_with(GroupLog::new);
        group.revision += 1;
        let event = MembershipEvent {
            group: instance.group.clone(),
            kind,
            instance,
        };
        if group.log.len() == EVENT_LOG_CAPACITY {
            group.log.pop_front();
        }
        group.log.push_back((group.revision, event.clone()));
        // No receivers is fine: nobody is watching this group right now.
        let _ = group.tx.send(event);
    }

    fn expire_due(
        &mut self,
        now: Instant,
    ) -> usize {
        let expired: Vec<RegistrationId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(lease) = self.leases.remove(id) {
                info!(
                    group = %lease.instance.group,
                    id = %id,
                    "lease expired; removing {}:{}",
                    lease.instance.host,
                    lease.instance.port
                );
                self.emit(EventKind::Removed, lease.instance);
            }
        }
        expired.len()
    }
}

/// Outcome of asking for the changes after a given revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesSince {
    /// Events after the requested revision, oldest first (possibly none)
    Events {
        revision: u64,
        events: Vec<MembershipEvent>,
    },
    /// The requested revision is outside the retained log; list again
    Resync { revision: u64 },
}

/// Lease-backed membership store with change notification.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client session on this coordinator.
    pub fn session(&self) -> MemorySession {
        MemorySession::new(self.clone())
    }

    pub fn register(
        &self,
        group: &str,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> CoordinationResult<RegistrationId> {
        validate_group(group)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire_due(now);

        let id = RegistrationId::generate();
        let instance = ServiceInstance {
            group: group.to_string(),
            host: host.to_string(),
            port,
            registration_id: id.clone(),
            state: InstanceState::Online,
        };
        state.leases.insert(
            id.clone(),
            Lease {
                instance: instance.clone(),
                ttl,
                expires_at: now + ttl,
            },
        );
        state.emit(EventKind::Added, instance);
        debug!(group, %id, "registered {host}:{port}");
        Ok(id)
    }

    pub fn renew(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire_due(now);
        match state.leases.get_mut(id) {
            Some(lease) => {
                lease.expires_at = now + lease.ttl;
                Ok(())
            }
            None => Err(CoordinationError::LeaseNotFound(id.clone())),
        }
    }

    pub fn update_state(
        &self,
        id: &RegistrationId,
        next: InstanceState,
    ) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| CoordinationError::LeaseNotFound(id.clone()))?;
        if lease.instance.state == next {
            return Ok(());
        }
        let updated = ServiceInstance {
            state: next,
            ..lease.instance.clone()
        };
        lease.instance = updated.clone();
        state.emit(EventKind::Updated, updated);
        Ok(())
    }

    pub fn unregister(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        let lease = state
            .leases
            .remove(id)
            .ok_or_else(|| CoordinationError::LeaseNotFound(id.clone()))?;
        state.emit(EventKind::Removed, lease.instance);
        Ok(())
    }

    /// Drops a lease without a deregistration, as if its holder had crashed
    /// and the TTL had run out.
    pub fn evict(
        &self,
        id: &RegistrationId,
    ) -> bool {
        let mut state = self.state.lock();
        match state.leases.remove(id) {
            Some(lease) => {
                info!(group = %lease.instance.group, %id, "lease evicted");
                state.emit(EventKind::Removed, lease.instance);
                true
            }
            None => false,
        }
    }

    /// Current members of `group` in snapshot order.
    pub fn members(
        &self,
        group: &str,
    ) -> CoordinationResult<Vec<ServiceInstance>> {
        validate_group(group)?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        let mut members: Vec<ServiceInstance> = state
            .leases
            .values()
            .filter(|lease| lease.instance.group == group)
            .map(|lease| lease.instance.clone())
            .collect();
        sort_instances(&mut members);
        Ok(members)
    }

    pub fn revision(
        &self,
        group: &str,
    ) -> u64 {
        self.state.lock().groups.get(group).map(|g| g.revision).unwrap_or(0)
    }

    /// Live events of `group`. Fails on a malformed group name, which would
    /// otherwise leave an empty log behind.
    pub fn subscribe(
        &self,
        group: &str,
    ) -> CoordinationResult<broadcast::Receiver<MembershipEvent>> {
        validate_group(group)?;
        let mut state = self.state.lock();
        Ok(state
            .groups
            .entry(group.to_string())
            .or_insert_with(GroupLog::new)
            .tx
            .subscribe())
    }

    /// Events of `group` newer than `since`.
    pub fn changes_since(
        &self,
        group: &str,
        since: u64,
    ) -> ChangesSince {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        let Some(log) = state.groups.get(group) else {
            return if since == 0 {
                ChangesSince::Events {
                    revision: 0,
                    events: Vec::new(),
                }
            } else {
                ChangesSince::Resync { revision: 0 }
            };
        };

        if since > log.revision {
            return ChangesSince::Resync {
                revision: log.revision,
            };
        }
        if since == log.revision {
            return ChangesSince::Events {
                revision: log.revision,
                events: Vec::new(),
            };
        }
        match log.log.front() {
            Some((oldest, _)) if *oldest <= since + 1 => ChangesSince::Events {
                revision: log.revision,
                events: log
                    .log
                    .iter()
                    .filter(|(rev, _)| *rev > since)
                    .map(|(_, e)| e.clone())
                    .collect(),
            },
            _ => ChangesSince::Resync {
                revision: log.revision,
            },
        }
    }

    /// Expires every lease whose deadline has passed. Returns how many went.
    pub fn expire_due(&self) -> usize {
        self.state.lock().expire_due(Instant::now())
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Periodically expires due leases until `token` is cancelled.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.expire_due();
                    }
                }
            }
            debug!("lease reaper stopped");
        })
    }
}

/// One client connection to a [`MemoryCoordinator`].
#[derive(Debug)]
pub struct MemorySession {
    coordinator: MemoryCoordinator,
    partitioned: AtomicBool,
    streams: Mutex<CancellationToken>,
}

impl MemorySession {
    pub fn new(coordinator: MemoryCoordinator) -> Self {
        Self {
            coordinator,
            partitioned: AtomicBool::new(false),
            streams: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    /// Cuts the session off: every call fails as unreachable and open watch
    /// streams end.
    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
        let mut token = self.streams.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn heal(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    fn check(&self) -> CoordinationResult<()> {
        if self.is_partitioned() {
            Err(CoordinationError::Unreachable("session partitioned".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl CoordinationBackend for MemorySession {
    async fn connect(&self) -> CoordinationResult<()> {
        self.check()
    }

    async fn register_ephemeral(
        &self,
        group: &str,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> CoordinationResult<RegistrationId> {
        self.check()?;
        self.coordinator.register(group, host, port, ttl)
    }

    async fn renew(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.check()?;
        self.coordinator.renew(id)
    }

    async fn update_state(
        &self,
        id: &RegistrationId,
        state: InstanceState,
    ) -> CoordinationResult<()> {
        self.check()?;
        self.coordinator.update_state(id, state)
    }

    async fn unregister(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.check()?;
        self.coordinator.unregister(id)
    }

    async fn list_members(
        &self,
        group: &str,
    ) -> CoordinationResult<Vec<ServiceInstance>> {
        self.check()?;
        self.coordinator.members(group)
    }

    async fn watch(
        &self,
        group: &str,
    ) -> CoordinationResult<WatchStream> {
        self.check()?;
        let rx = self.coordinator.subscribe(group)?;
        let token = self.streams.lock().clone();
        let stream = BroadcastStream::new(rx)
            .map(|item| match item {
                Ok(event) => vec![event],
                // Lagged: events were lost, ask the watcher to resync
                Err(_) => Vec::new(),
            })
            .take_until(token.cancelled_owned());
        Ok(Box::pin(stream))
    }
}
