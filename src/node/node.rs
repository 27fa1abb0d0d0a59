//! A running proxy process.
//!
//! ## Key Responsibilities
//! - Owns every background task started by [`super::NodeBuilder`]
//! - Runs until the external shutdown signal fires or the membership
//!   registrar turns fatal
//! - Deregisters this process's endpoints before the listeners close

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::coordination::CoordinationClient;
use crate::coordination::MemoryCoordinator;
use crate::coordination::RegistrationId;
use crate::listener::ListenerMetaIndex;
use crate::membership::MembershipRegistrar;
use crate::membership::RegistrarHealth;
use crate::routing::ForwardingEngine;
use crate::Error;
use crate::Result;
use crate::Settings;

pub struct Node {
    pub(super) settings: Arc<Settings>,
    pub(super) client: Arc<CoordinationClient>,
    pub(super) listeners: Arc<ListenerMetaIndex>,
    pub(super) engine: Arc<ForwardingEngine>,
    pub(super) registrar: Option<MembershipRegistrar>,
    pub(super) registrations: Vec<RegistrationId>,
    /// The embedded coordinator, if this node hosts one
    pub(super) coordinator: Option<MemoryCoordinator>,
    /// Configured listen address -> bound socket address
    pub(super) proxy_addresses: BTreeMap<String, SocketAddr>,
    pub(super) forward_proxy_address: Option<SocketAddr>,
    pub(super) admin_address: Option<SocketAddr>,
    pub(super) coordination_address: Option<SocketAddr>,

    pub(super) shutdown_signal: watch::Receiver<()>,
    /// Stops servers, watchers and the connection supervisor
    pub(super) stop_tx: watch::Sender<()>,
    /// Stops the lease reaper
    pub(super) background: CancellationToken,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(super) stopped: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("proxy_addresses", &self.proxy_addresses)
            .field("forward_proxy_address", &self.forward_proxy_address)
            .field("admin_address", &self.admin_address)
            .field("coordination_address", &self.coordination_address)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Serves until shutdown. Returns [`Error::Fatal`] if the registrar gave
    /// up keeping this process's registrations alive.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_signal.clone();
        let registrar_health = self.registrar.as_ref().map(|r| r.subscribe_health());

        let fatal = async move {
            let Some(mut health) = registrar_health else {
                return std::future::pending::<Option<String>>().await;
            };
            health
                .wait_for(|h| matches!(h, RegistrarHealth::Fatal { .. }))
                .await
                .ok()
                .and_then(|h| match &*h {
                    RegistrarHealth::Fatal { reason } => Some(reason.clone()),
                    _ => None,
                })
        };

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown signal received");
                None
            }
            reason = fatal => reason,
        };

        self.shutdown().await;

        match outcome {
            Some(reason) => {
                error!(%reason, "node stopped: membership registrar is fatal");
                Err(Error::Fatal(reason))
            }
            None => Ok(()),
        }
    }

    /// Deregisters, stops every server and background task, and waits for
    /// them. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registrar) = &self.registrar {
            registrar.shutdown().await;
        }
        let _ = self.stop_tx.send(());
        self.background.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    pub fn listeners(&self) -> &Arc<ListenerMetaIndex> {
        &self.listeners
    }

    pub fn engine(&self) -> &Arc<ForwardingEngine> {
        &self.engine
    }

    pub fn registrar(&self) -> Option<&MembershipRegistrar> {
        self.registrar.as_ref()
    }

    /// Handles of the registrations announced at startup.
    pub fn registrations(&self) -> &[RegistrationId] {
        &self.registrations
    }

    pub fn coordinator(&self) -> Option<&MemoryCoordinator> {
        self.coordinator.as_ref()
    }

    /// The bound address of the proxy for a configured listen address.
    pub fn proxy_address(
        &self,
        listen_address: &str,
    ) -> Option<SocketAddr> {
        self.proxy_addresses.get(listen_address).copied()
    }

    /// Where the forward proxy listens, when `forward_proxy.enabled`.
    pub fn forward_proxy_address(&self) -> Option<SocketAddr> {
        self.forward_proxy_address
    }

    pub fn admin_address(&self) -> Option<SocketAddr> {
        self.admin_address
    }

    pub fn coordination_address(&self) -> Option<SocketAddr> {
        self.coordination_address
    }
}
