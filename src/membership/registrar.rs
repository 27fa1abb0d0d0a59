use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::coordination::validate_group;
use crate::coordination::CoordinationClient;
use crate::coordination::InstanceState;
use crate::coordination::RegistrationId;
use crate::metrics::RENEWAL_FAILURES;
use crate::CoordinationError;
use crate::MembershipConfig;
use crate::RegistrationError;

/// Health signal the registrar publishes to its host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarHealth {
    Healthy,
    /// Some registration is failing to renew or re-register
    Degraded { consecutive_failures: u32 },
    /// A registration could not be kept alive after the configured number of
    /// consecutive failures; the host should terminate
    Fatal { reason: String },
}

/// One registration kept alive by a background renewal task.
///
/// Keyed by the id returned from the first successful registration. When the
/// lease is lost a fresh registration replaces `current`, but callers keep
/// using the original id as their handle.
struct Keepalive {
    group: String,
    host: String,
    port: u16,
    current: ArcSwap<RegistrationId>,
    state: Mutex<InstanceState>,
    failures: AtomicU32,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Keepalive {
    fn current(&self) -> RegistrationId {
        (*self.current.load_full()).clone()
    }
}

struct RegistrarInner {
    client: Arc<CoordinationClient>,
    config: MembershipConfig,
    slots: DashMap<RegistrationId, Arc<Keepalive>>,
    health_tx: watch::Sender<RegistrarHealth>,
    shutdown: CancellationToken,
}

/// Registers this process's endpoints as lease-backed group members and keeps
/// the leases alive.
#[derive(Clone)]
pub struct MembershipRegistrar {
    inner: Arc<RegistrarInner>,
}

impl std::fmt::Debug for MembershipRegistrar {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MembershipRegistrar")
            .field("registrations", &self.inner.slots.len())
            .field("health", &*self.inner.health_tx.borrow())
            .finish()
    }
}

impl MembershipRegistrar {
    /// The config is expected to be validated (`renew_interval < lease_ttl`).
    pub fn new(
        client: Arc<CoordinationClient>,
        config: MembershipConfig,
    ) -> Self {
        let (health_tx, _) = watch::channel(RegistrarHealth::Healthy);
        Self {
            inner: Arc::new(RegistrarInner {
                client,
                config,
                slots: DashMap::new(),
                health_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub async fn register(
        &self,
        group: &str,
        host: &str,
        port: u16,
    ) -> Result<RegistrationId, RegistrationError> {
        validate_group(group).map_err(|_| RegistrationError::InvalidGroup(group.to_string()))?;
        let id = self
            .inner
            .client
            .register_ephemeral(group, host, port, self.inner.config.lease_ttl())
            .await
            .map_err(|source| match source {
                CoordinationError::InvalidGroup(g) => RegistrationError::InvalidGroup(g),
                source => RegistrationError::Unreachable {
                    group: group.to_string(),
                    source,
                },
            })?;

        let keepalive = Arc::new(Keepalive {
            group: group.to_string(),
            host: host.to_string(),
            port,
            current: ArcSwap::from_pointee(id.clone()),
            state: Mutex::new(InstanceState::Online),
            failures: AtomicU32::new(0),
            stop: self.inner.shutdown.child_token(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(renew_loop(self.inner.clone(), keepalive.clone()));
        *keepalive.task.lock() = Some(task);
        self.inner.slots.insert(id.clone(), keepalive);

        info!(group, %id, "registered {host}:{port}");
        Ok(id)
    }

    /// Removes the registration behind `id` from its group.
    pub async fn deregister(
        &self,
        id: &RegistrationId,
    ) -> Result<(), RegistrationError> {
        let (_, keepalive) = self
            .inner
            .slots
            .remove(id)
            .ok_or_else(|| RegistrationError::UnknownRegistration(id.clone()))?;
        keepalive.stop.cancel();
        let task = keepalive.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.refresh_health();

        let current = keepalive.current();
        match self.inner.client.unregister(&current).await {
            Ok(()) | Err(CoordinationError::LeaseNotFound(_)) => {
                info!(group = %keepalive.group, id = %current, "deregistered");
                Ok(())
            }
            Err(source) => Err(RegistrationError::Deregister { id: id.clone(), source }),
        }
    }

    /// Moves the registration to `state`, e.g. `Draining` before shutdown.
    /// The state survives re-registration after a lost lease.
    pub async fn set_state(
        &self,
        id: &RegistrationId,
        state: InstanceState,
    ) -> Result<(), RegistrationError> {
        let keepalive = self
            .inner
            .slots
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| RegistrationError::UnknownRegistration(id.clone()))?;
        *keepalive.state.lock() = state;
        self.inner
            .client
            .update_state(&keepalive.current(), state)
            .await
            .map_err(|source| RegistrationError::Update { id: id.clone(), source })
    }

    /// The live lease id behind a registration handle.
    pub fn current_id(
        &self,
        id: &RegistrationId,
    ) -> Option<RegistrationId> {
        self.inner.slots.get(id).map(|slot| slot.current())
    }

    pub fn registrations(&self) -> Vec<RegistrationId> {
        self.inner.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    pub fn health(&self) -> RegistrarHealth {
        self.inner.health_tx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<RegistrarHealth> {
        self.inner.health_tx.subscribe()
    }

    /// Stops every renewal task and deregisters every registration.
    pub async fn shutdown(&self) {
        for id in self.registrations() {
            if let Err(e) = self.deregister(&id).await {
                warn!(%id, error = %e, "deregistration during shutdown failed");
            }
        }
        self.inner.shutdown.cancel();
    }
}

impl RegistrarInner {
    fn refresh_health(&self) {
        let worst = self
            .slots
            .iter()
            .map(|slot| slot.failures.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0);
        let next = if worst >= self.config.max_consecutive_failures {
            RegistrarHealth::Fatal {
                reason: format!("registration failed {worst} consecutive times"),
            }
        } else if worst > 0 {
            RegistrarHealth::Degraded {
                consecutive_failures: worst,
            }
        } else {
            RegistrarHealth::Healthy
        };
        self.health_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                if let RegistrarHealth::Fatal { reason } = &next {
                    error!(%reason, "membership registrar is fatal");
                }
                *current = next;
                true
            }
        });
    }

    fn record_failure(
        &self,
        keepalive: &Keepalive,
    ) -> u32 {
        RENEWAL_FAILURES.with_label_values(&[&keepalive.group]).inc();
        keepalive.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// One renewal period: renew, or replace a lost lease with a fresh one.
    async fn tick(
        &self,
        keepalive: &Keepalive,
    ) {
        let current = keepalive.current();
        let lost = if keepalive.failures.load(Ordering::SeqCst) >= self.config.lost_after_failures {
            true
        } else {
            match self.client.renew(&current).await {
                Ok(()) => {
                    if keepalive.failures.swap(0, Ordering::SeqCst) > 0 {
                        info!(group = %keepalive.group, id = %current, "lease renewal recovered");
                    }
                    false
                }
                Err(e) => {
                    let failures = self.record_failure(keepalive);
                    warn!(group = %keepalive.group, id = %current, failures, error = %e, "lease renewal failed");
                    matches!(e, CoordinationError::LeaseNotFound(_))
                        || failures >= self.config.lost_after_failures
                }
            }
        };

        if lost {
            self.reregister(keepalive, &current).await;
        }
        self.refresh_health();
    }

    async fn reregister(
        &self,
        keepalive: &Keepalive,
        previous: &RegistrationId,
    ) {
        let result = self
            .client
            .register_ephemeral(
                &keepalive.group,
                &keepalive.host,
                keepalive.port,
                self.config.lease_ttl(),
            )
            .await;
        match result {
            Ok(fresh) => {
                info!(
                    group = %keepalive.group,
                    previous = %previous,
                    id = %fresh,
                    "lease lost; registered again"
                );
                keepalive.current.store(Arc::new(fresh.clone()));
                keepalive.failures.store(0, Ordering::SeqCst);

                // The old lease may still be alive if only the connection dropped.
                if let Err(e) = self.client.unregister(previous).await {
                    debug!(id = %previous, error = %e, "stale lease cleanup skipped");
                }
                let state = *keepalive.state.lock();
                if state != InstanceState::Online {
                    if let Err(e) = self.client.update_state(&fresh, state).await {
                        warn!(id = %fresh, error = %e, "failed to restore instance state");
                    }
                }
            }
            Err(e) => {
                let failures = self.record_failure(keepalive);
                warn!(group = %keepalive.group, failures, error = %e, "re-registration failed");
            }
        }
    }
}

async fn renew_loop(
    inner: Arc<RegistrarInner>,
    keepalive: Arc<Keepalive>,
) {
    let period = inner.config.renew_interval();
    loop {
        tokio::select! {
            _ = keepalive.stop.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        tokio::select! {
            _ = keepalive.stop.cancelled() => break,
            _ = inner.tick(&keepalive) => {}
        }
    }
    debug!(group = %keepalive.group, "renewal task stopped");
}
