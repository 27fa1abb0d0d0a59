//! Assembles a [`Node`] from [`Settings`].
//!
//! ## Startup order
//! 1. coordination backend (embedded coordinator with its lease reaper and
//!    optional HTTP front, or a remote client) and the connection supervisor;
//! 2. one discovery watcher per target group and the listener index;
//! 3. one proxy server per listener, the forward proxy when enabled, then
//!    the admin surface;
//! 4. the registrations this process announces, once it is serving. An
//!    enabled forward proxy with a group announces its bound address too.
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let node = NodeBuilder::new(None, shutdown_rx)?
//!     .transport(custom_transport) // Optional override
//!     .build()
//!     .await?;
//! node.run().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Node;
use crate::admin::AdminServer;
use crate::coordination::CoordinationBackend;
use crate::coordination::CoordinationClient;
use crate::coordination::CoordinatorServer;
use crate::coordination::MemoryCoordinator;
use crate::coordination::RemoteBackend;
use crate::discovery::DiscoveryRegistry;
use crate::listener::ListenerMetaIndex;
use crate::membership::MembershipRegistrar;
use crate::metrics;
use crate::routing::ForwardProxyServer;
use crate::routing::ForwardingEngine;
use crate::routing::HttpTransport;
use crate::routing::ProxyServer;
use crate::routing::Transport;
use crate::utils::async_task::spawn_task;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::CoordinationError;
use crate::CoordinationMode;
use crate::RegistrationError;
use crate::Result;
use crate::Settings;

pub struct NodeBuilder {
    pub(super) settings: Settings,
    pub(super) shutdown_signal: watch::Receiver<()>,
    pub(super) backend: Option<Arc<dyn CoordinationBackend>>,
    pub(super) coordinator: Option<MemoryCoordinator>,
    pub(super) transport: Option<Arc<dyn Transport>>,
}

impl NodeBuilder {
    /// Loads settings from the environment (and `CONFIG_PATH`), layering
    /// `config_path` on top when given.
    pub fn new(
        config_path: Option<&str>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Result<Self> {
        let mut settings = Settings::new()?;
        if let Some(p) = config_path {
            info!("with_override_config from: {}", p);
            settings = settings.with_override_config(p)?;
        }
        Ok(Self::init(settings, shutdown_signal))
    }

    pub fn init(
        settings: Settings,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            settings,
            shutdown_signal,
            backend: None,
            coordinator: None,
            transport: None,
        }
    }

    /// Uses `backend` instead of the one `coordination.mode` selects.
    pub fn coordination_backend(
        mut self,
        backend: Arc<dyn CoordinationBackend>,
    ) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Embedded mode: host `coordinator` instead of a fresh one.
    pub fn memory_coordinator(
        mut self,
        coordinator: MemoryCoordinator,
    ) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn transport(
        mut self,
        transport: Arc<dyn Transport>,
    ) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validates the settings, starts every component and returns the node
    /// once all of its sockets are bound and its registrations are in place.
    ///
    /// On error everything started so far is stopped again.
    pub async fn build(self) -> Result<Node> {
        let settings = self.settings.validate()?;
        metrics::init();

        let (stop_tx, _) = watch::channel(());
        let background = CancellationToken::new();
        let abort_guard = background.clone().drop_guard();
        let mut tasks = Vec::new();

        // 1. Coordination
        let (backend, coordinator): (Arc<dyn CoordinationBackend>, Option<MemoryCoordinator>) = match self.backend {
            Some(backend) => (backend, None),
            None => match settings.coordination.mode {
                CoordinationMode::Embedded => {
                    let coordinator = self.coordinator.unwrap_or_default();
                    (
                        Arc::new(coordinator.session()) as Arc<dyn CoordinationBackend>,
                        Some(coordinator),
                    )
                }
                CoordinationMode::Remote => {
                    info!(endpoint = %settings.coordination.endpoint, "using remote coordination service");
                    (
                        Arc::new(RemoteBackend::new(&settings.coordination)) as Arc<dyn CoordinationBackend>,
                        None,
                    )
                }
            },
        };

        let mut coordination_address = None;
        if let Some(coordinator) = &coordinator {
            tasks.push(coordinator.spawn_reaper(settings.coordination.reap_interval(), background.child_token()));
            if let Some(addr) = settings.coordination.serve_address {
                let (bound, server) = CoordinatorServer::new(coordinator.clone()).bind(addr, stop_tx.subscribe())?;
                coordination_address = Some(bound);
                spawn_task(
                    "coordination server",
                    move || async move {
                        server.await;
                        Ok(())
                    },
                    Some(&mut tasks),
                );
            }
        }

        let client = CoordinationClient::new(backend, settings.coordination.reconnect);
        tasks.push(client.spawn_supervisor(stop_tx.subscribe()));

        // 2. Discovery and listener index
        let mut discovery = DiscoveryRegistry::new(client.clone(), settings.discovery.clone());
        let listeners = Arc::new(ListenerMetaIndex::build(&settings.listeners, &mut discovery)?);
        let statuses = discovery.statuses();
        tasks.extend(discovery.spawn(stop_tx.subscribe()));

        // 3. Serving
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(&settings.transport)) as Arc<dyn Transport>);
        let engine = Arc::new(ForwardingEngine::new(listeners.clone(), transport.clone()));

        let mut proxy_addresses = BTreeMap::new();
        for entry in listeners.iter() {
            let server = ProxyServer::new(entry.meta.listen_address.clone(), engine.clone());
            let (bound, serving) = server.bind(stop_tx.subscribe())?;
            proxy_addresses.insert(entry.meta.listen_address.clone(), bound);
            spawn_task(
                "proxy server",
                move || async move {
                    serving.await;
                    Ok(())
                },
                Some(&mut tasks),
            );
        }

        let mut announcements: Vec<(String, String, u16)> = settings
            .registrations
            .iter()
            .map(|r| (r.group.clone(), r.host.clone(), r.port))
            .collect();

        let mut forward_proxy_address = None;
        if settings.forward_proxy.enabled {
            let (bound, serving) =
                ForwardProxyServer::new(transport).bind(settings.forward_proxy.listen_address, stop_tx.subscribe())?;
            forward_proxy_address = Some(bound);
            if let Some(group) = &settings.forward_proxy.group {
                announcements.push((group.clone(), settings.forward_proxy.advertised_host(bound), bound.port()));
            }
            spawn_task(
                "forward proxy",
                move || async move {
                    serving.await;
                    Ok(())
                },
                Some(&mut tasks),
            );
        }

        let registrar = if announcements.is_empty() {
            None
        } else {
            Some(MembershipRegistrar::new(client.clone(), settings.membership.clone()))
        };

        let mut admin_address = None;
        if settings.admin.enabled {
            let mut admin = AdminServer::new(listeners.clone(), client.clone()).with_discovery(statuses);
            if let Some(registrar) = &registrar {
                admin = admin.with_registrar(registrar.clone());
            }
            let (bound, serving) = admin.bind(settings.admin.listen_address, stop_tx.subscribe())?;
            admin_address = Some(bound);
            spawn_task(
                "admin server",
                move || async move {
                    serving.await;
                    Ok(())
                },
                Some(&mut tasks),
            );
        }

        // 4. Announce
        let mut registrations = Vec::new();
        if let Some(registrar) = &registrar {
            for (group, host, port) in &announcements {
                let registered = task_with_timeout_and_exponential_backoff(
                    "register",
                    &settings.coordination.reconnect,
                    || registrar.register(group, host, *port),
                    |deadline| RegistrationError::Unreachable {
                        group: group.clone(),
                        source: CoordinationError::Timeout(deadline),
                    },
                )
                .await;
                match registered {
                    Ok(id) => registrations.push(id),
                    Err(e) => {
                        registrar.shutdown().await;
                        return Err(e.into());
                    }
                }
            }
        }

        abort_guard.disarm();
        info!(
            listeners = listeners.len(),
            registrations = registrations.len(),
            "node started"
        );

        Ok(Node {
            settings: Arc::new(settings),
            client,
            listeners,
            engine,
            registrar,
            registrations,
            coordinator,
            proxy_addresses,
            forward_proxy_address,
            admin_address,
            coordination_address,
            shutdown_signal: self.shutdown_signal,
            stop_tx,
            background,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }
}
