use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::validate_group;
use super::CoordinationBackend;
use super::CoordinationResult;
use super::ConnectionState;
use super::InstanceState;
use super::RegistrationId;
use super::ServiceInstance;
use super::WatchStream;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::CoordinationError;

/// Process-wide handle to the coordination service.
///
/// Shared as `Arc<CoordinationClient>` by the registrar and every discovery
/// watcher. Any call that fails for connectivity reasons flips the connection
/// state to `Disconnected`; reconnects go through [`CoordinationClient::reconnect`]
/// which admits one attempt at a time.
pub struct CoordinationClient {
    backend: Arc<dyn CoordinationBackend>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_lock: Mutex<()>,
    reconnect_policy: BackoffPolicy,
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("state", &*self.state_tx.borrow())
            .field("reconnect_policy", &self.reconnect_policy)
            .finish_non_exhaustive()
    }
}

impl CoordinationClient {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        reconnect_policy: BackoffPolicy,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            backend,
            state_tx,
            reconnect_lock: Mutex::new(()),
            reconnect_policy,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the connection state is `Connected`.
    pub async fn wait_connected(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    pub fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(
        &self,
        next: ConnectionState,
    ) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            match next {
                ConnectionState::Connected => info!("coordination session connected"),
                ConnectionState::Disconnected => warn!("coordination session lost"),
            }
        }
    }

    fn observe<T>(
        &self,
        result: CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        if let Err(e) = &result {
            if e.is_connectivity() {
                debug!(error = %e, "coordination call failed on connectivity");
                self.mark_disconnected();
            }
        }
        result
    }

    /// Retries `connect` with the configured backoff until it succeeds or the
    /// retry budget runs out. Concurrent callers queue behind the one attempt
    /// in flight and return as soon as it has connected.
    pub async fn reconnect(&self) -> CoordinationResult<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        task_with_timeout_and_exponential_backoff(
            "coordination reconnect",
            &self.reconnect_policy,
            || self.backend.connect(),
            CoordinationError::Timeout,
        )
        .await?;
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Background task that reconnects whenever the session is lost.
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = client.subscribe_state();
            loop {
                let lost = async {
                    state_rx
                        .wait_for(|s| *s == ConnectionState::Disconnected)
                        .await
                        .is_ok()
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    open = lost => {
                        if !open {
                            break;
                        }
                    }
                }
                let reconnected = tokio::select! {
                    _ = shutdown.changed() => break,
                    r = client.reconnect() => r,
                };
                if let Err(e) = reconnected {
                    warn!(error = %e, "reconnect budget exhausted; retrying after backoff cap");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(Duration::from_millis(client.reconnect_policy.max_delay_ms)) => {}
                    }
                }
            }
            debug!("coordination supervisor stopped");
        })
    }

    pub async fn register_ephemeral(
        &self,
        group: &str,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> CoordinationResult<RegistrationId> {
        validate_group(group)?;
        self.observe(self.backend.register_ephemeral(group, host, port, ttl).await)
    }

    pub async fn renew(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.observe(self.backend.renew(id).await)
    }

    pub async fn update_state(
        &self,
        id: &RegistrationId,
        state: InstanceState,
    ) -> CoordinationResult<()> {
        self.observe(self.backend.update_state(id, state).await)
    }

    pub async fn unregister(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.observe(self.backend.unregister(id).await)
    }

    pub async fn list_members(
        &self,
        group: &str,
    ) -> CoordinationResult<Vec<ServiceInstance>> {
        validate_group(group)?;
        self.observe(self.backend.list_members(group).await)
    }

    pub async fn watch(
        &self,
        group: &str,
    ) -> CoordinationResult<WatchStream> {
        validate_group(group)?;
        self.observe(self.backend.watch(group).await)
    }
}
