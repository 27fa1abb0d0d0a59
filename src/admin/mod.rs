//! Operator-facing HTTP surface.
//!
//! - `GET /status`  per-listener view of the online server index
//! - `GET /health`  coordination, discovery and registrar health; 503 once the
//!   registrar is fatal
//! - `GET /metrics` Prometheus text exposition


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Reply;

use crate::coordination::ConnectionState;
use crate::coordination::CoordinationClient;
use crate::discovery::DiscoveryHealth;
use crate::discovery::WatcherStatus;
use crate::listener::ListenerMetaIndex;
use crate::membership::MembershipRegistrar;
use crate::membership::RegistrarHealth;
use crate::metrics;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub listen_address: String,
    pub target_group_name: String,
    pub online_server_count: usize,
    /// Online servers not currently cooling down
    pub healthy_server_count: usize,
    /// `None` until the group has been listed once
    pub snapshot_version: Option<u64>,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Ok,
    Degraded,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHealth {
    pub group: String,
    pub state: String,
    pub stale_for_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub coordination: String,
    pub discovery: Vec<GroupHealth>,
    pub registrar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HealthReport {
    pub fn assemble(
        connection: ConnectionState,
        discovery: &[(String, DiscoveryHealth)],
        registrar: Option<&RegistrarHealth>,
    ) -> Self {
        let mut status = OverallHealth::Ok;
        let mut reason = None;

        let coordination = match connection {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => {
                status = OverallHealth::Degraded;
                "disconnected"
            }
        };

        let discovery = discovery
            .iter()
            .map(|(group, health)| {
                let (state, since) = match health {
                    DiscoveryHealth::Live => ("live", None),
                    DiscoveryHealth::Stale { since } => ("stale", Some(*since)),
                    DiscoveryHealth::Degraded { since } => ("degraded", Some(*since)),
                };
                if since.is_some() {
                    status = OverallHealth::Degraded;
                }
                GroupHealth {
                    group: group.clone(),
                    state: state.to_string(),
                    stale_for_ms: since.map(|s| s.elapsed().as_millis() as u64),
                }
            })
            .collect();

        let registrar = match registrar {
            None => "disabled".to_string(),
            Some(RegistrarHealth::Healthy) => "healthy".to_string(),
            Some(RegistrarHealth::Degraded { consecutive_failures }) => {
                status = OverallHealth::Degraded;
                format!("degraded ({consecutive_failures} consecutive failures)")
            }
            Some(RegistrarHealth::Fatal { reason: why }) => {
                status = OverallHealth::Fatal;
                reason = Some(why.clone());
                "fatal".to_string()
            }
        };

        Self {
            status,
            coordination: coordination.to_string(),
            discovery,
            registrar,
            reason,
        }
    }
}

#[derive(Clone)]
struct AdminState {
    listeners: Arc<ListenerMetaIndex>,
    client: Arc<CoordinationClient>,
    discovery: Arc<Vec<(String, WatcherStatus)>>,
    registrar: Option<MembershipRegistrar>,
}

impl AdminState {
    fn status(&self) -> Vec<ListenerStatus> {
        self.listeners
            .iter()
            .map(|entry| {
                let snapshot = entry.servers.current();
                ListenerStatus {
                    listen_address: entry.meta.listen_address.clone(),
                    target_group_name: entry.meta.target_group.clone(),
                    online_server_count: snapshot.len(),
                    healthy_server_count: entry.servers.balancer().healthy_count(),
                    snapshot_version: snapshot.listed_version(),
                    stale: snapshot.is_stale(),
                }
            })
            .collect()
    }

    fn health(&self) -> HealthReport {
        let discovery: Vec<(String, DiscoveryHealth)> = self
            .discovery
            .iter()
            .map(|(group, status)| (group.clone(), status.health()))
            .collect();
        let registrar = self.registrar.as_ref().map(|r| r.health());
        HealthReport::assemble(self.client.state(), &discovery, registrar.as_ref())
    }
}

pub struct AdminServer {
    state: AdminState,
}

impl AdminServer {
    pub fn new(
        listeners: Arc<ListenerMetaIndex>,
        client: Arc<CoordinationClient>,
    ) -> Self {
        Self {
            state: AdminState {
                listeners,
                client,
                discovery: Arc::new(Vec::new()),
                registrar: None,
            },
        }
    }

    pub fn with_discovery(
        mut self,
        statuses: Vec<(String, WatcherStatus)>,
    ) -> Self {
        self.state.discovery = Arc::new(statuses);
        self
    }

    pub fn with_registrar(
        mut self,
        registrar: MembershipRegistrar,
    ) -> Self {
        self.state.registrar = Some(registrar);
        self
    }

    pub fn status(&self) -> Vec<ListenerStatus> {
        self.state.status()
    }

    pub fn health(&self) -> HealthReport {
        self.state.health()
    }

    pub fn routes(&self) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
        let state = self.state.clone();
        let with_state = warp::any().map(move || state.clone());

        let status = warp::path!("status")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(handle_status);
        let health = warp::path!("health")
            .and(warp::get())
            .and(with_state)
            .and_then(handle_health);
        let metrics = warp::path!("metrics").and(warp::get()).and_then(handle_metrics);

        status.or(health).unify().or(metrics).unify()
    }

    pub fn bind(
        &self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send + 'static)> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
        info!(%bound, "admin surface listening");
        Ok((bound, server))
    }
}

async fn handle_status(state: AdminState) -> std::result::Result<Response, Infallible> {
    Ok(warp::reply::json(&state.status()).into_response())
}

async fn handle_health(state: AdminState) -> std::result::Result<Response, Infallible> {
    let report = state.health();
    let code = match report.status {
        OverallHealth::Fatal => StatusCode::SERVICE_UNAVAILABLE,
        OverallHealth::Ok | OverallHealth::Degraded => StatusCode::OK,
    };
    Ok(warp::reply::with_status(warp::reply::json(&report), code).into_response())
}

async fn handle_metrics() -> std::result::Result<Response, Infallible> {
    Ok(warp::reply::with_header(
        metrics::gather_text(),
        "content-type",
        "text/plain; version=0.0.4; charset=utf-8",
    )
    .into_response())
}
