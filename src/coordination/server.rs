//! HTTP/JSON front for a [`MemoryCoordinator`].
//!
//! Routes (all under `/v1`):
//! - `GET    /ping`
//! - `POST   /members`              register `{group, host, port, ttl_ms}`
//! - `GET    /members?group=`       list members and the group revision
//! - `GET    /revision?group=`      current revision of a group
//! - `GET    /watch?group=&since=&timeout_ms=`  long-poll for changes
//! - `POST   /leases/{id}/renew`
//! - `PUT    /leases/{id}/state`    `{state}`
//! - `DELETE /leases/{id}`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Reply;

use super::validate_group;
use super::ChangesSince;
use super::InstanceState;
use super::MembershipEvent;
use super::MemoryCoordinator;
use super::RegistrationId;
use super::ServiceInstance;
use crate::CoordinationError;
use crate::Result;

/// Upper bound on a single long-poll, whatever the client asks for.
const MAX_WATCH_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegisterRequest {
    pub group: String,
    pub host: String,
    pub port: u16,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegisterResponse {
    pub registration_id: RegistrationId,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StateRequest {
    pub state: InstanceState,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MembersResponse {
    pub revision: u64,
    pub members: Vec<ServiceInstance>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RevisionResponse {
    pub revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WatchResponse {
    pub revision: u64,
    pub events: Vec<MembershipEvent>,
    /// The requested revision fell out of the log; the client must re-list
    #[serde(default)]
    pub resync: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    group: String,
}

#[derive(Debug, Deserialize)]
struct WatchQuery {
    group: String,
    since: u64,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Serves a [`MemoryCoordinator`] to other processes.
#[derive(Debug, Clone)]
pub struct CoordinatorServer {
    coordinator: MemoryCoordinator,
}

impl CoordinatorServer {
    pub fn new(coordinator: MemoryCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn routes(&self) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
        let with_coordinator = {
            let coordinator = self.coordinator.clone();
            warp::any().map(move || coordinator.clone())
        };

        let ping = warp::path!("v1" / "ping")
            .and(warp::get())
            .map(|| warp::reply::json(&"pong").into_response());

        let register = warp::path!("v1" / "members")
            .and(warp::post())
            .and(with_coordinator.clone())
            .and(warp::body::json())
            .and_then(handle_register);

        let members = warp::path!("v1" / "members")
            .and(warp::get())
            .and(with_coordinator.clone())
            .and(warp::query::<GroupQuery>())
            .and_then(handle_members);

        let revision = warp::path!("v1" / "revision")
            .and(warp::get())
            .and(with_coordinator.clone())
            .and(warp::query::<GroupQuery>())
            .and_then(handle_revision);

        let watch_route = warp::path!("v1" / "watch")
            .and(warp::get())
            .and(with_coordinator.clone())
            .and(warp::query::<WatchQuery>())
            .and_then(handle_watch);

        let renew = warp::path!("v1" / "leases" / String / "renew")
            .and(warp::post())
            .and(with_coordinator.clone())
            .and_then(handle_renew);

        let state = warp::path!("v1" / "leases" / String / "state")
            .and(warp::put())
            .and(with_coordinator.clone())
            .and(warp::body::json())
            .and_then(handle_state);

        let unregister = warp::path!("v1" / "leases" / String)
            .and(warp::delete())
            .and(with_coordinator)
            .and_then(handle_unregister);

        ping.or(register)
            .unify()
            .or(members)
            .unify()
            .or(revision)
            .unify()
            .or(watch_route)
            .unify()
            .or(renew)
            .unify()
            .or(state)
            .unify()
            .or(unregister)
            .unify()
    }

    /// Binds `addr` and serves until `shutdown` fires. Returns the bound
    /// address (useful with port 0) and the server future.
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
        info!(%bound, "coordination service listening");
        Ok((bound, server))
    }
}

fn error_reply(e: &CoordinationError) -> Response {
    let (status, kind) = match e {
        CoordinationError::LeaseNotFound(_) => (StatusCode::NOT_FOUND, "lease_not_found"),
        CoordinationError::InvalidGroup(_) => (StatusCode::BAD_REQUEST, "invalid_group"),
        CoordinationError::Unreachable(_) | CoordinationError::Timeout(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
        CoordinationError::Protocol(_) => (StatusCode::BAD_REQUEST, "protocol"),
    };
    let body = ErrorBody {
        error: kind.to_string(),
        message: e.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn empty_reply(status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply(), status).into_response()
}

async fn handle_register(
    coordinator: MemoryCoordinator,
    req: RegisterRequest,
) -> std::result::Result<Response, Infallible> {
    let ttl = Duration::from_millis(req.ttl_ms);
    Ok(match coordinator.register(&req.group, &req.host, req.port, ttl) {
        Ok(registration_id) => warp::reply::with_status(
            warp::reply::json(&RegisterResponse { registration_id }),
            StatusCode::CREATED,
        )
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn handle_members(
    coordinator: MemoryCoordinator,
    q: GroupQuery,
) -> std::result::Result<Response, Infallible> {
    Ok(match coordinator.members(&q.group) {
        Ok(members) => warp::reply::json(&MembersResponse {
            revision: coordinator.revision(&q.group),
            members,
        })
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn handle_revision(
    coordinator: MemoryCoordinator,
    q: GroupQuery,
) -> std::result::Result<Response, Infallible> {
    Ok(match validate_group(&q.group) {
        Ok(()) => warp::reply::json(&RevisionResponse {
            revision: coordinator.revision(&q.group),
        })
        .into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn handle_watch(
    coordinator: MemoryCoordinator,
    q: WatchQuery,
) -> std::result::Result<Response, Infallible> {
    let wait = Duration::from_millis(q.timeout_ms.unwrap_or(MAX_WATCH_TIMEOUT_MS).min(MAX_WATCH_TIMEOUT_MS));
    let deadline = Instant::now() + wait;
    // Subscribe before reading the log so nothing slips in between.
    let mut rx = match coordinator.subscribe(&q.group) {
        Ok(rx) => rx,
        Err(e) => return Ok(error_reply(&e)),
    };
    loop {
        match coordinator.changes_since(&q.group, q.since) {
            ChangesSince::Resync { revision } => {
                return Ok(warp::reply::json(&WatchResponse {
                    revision,
                    events: Vec::new(),
                    resync: true,
                })
                .into_response());
            }
            ChangesSince::Events { revision, events } => {
                if !events.is_empty() {
                    return Ok(warp::reply::json(&WatchResponse {
                        revision,
                        events,
                        resync: false,
                    })
                    .into_response());
                }
                if tokio::time::timeout_at(deadline, rx.recv()).await.is_err() {
                    return Ok(warp::reply::json(&WatchResponse {
                        revision,
                        events: Vec::new(),
                        resync: false,
                    })
                    .into_response());
                }
            }
        }
    }
}

async fn handle_renew(
    id: String,
    coordinator: MemoryCoordinator,
) -> std::result::Result<Response, Infallible> {
    Ok(match coordinator.renew(&RegistrationId::new(id)) {
        Ok(()) => empty_reply(StatusCode::NO_CONTENT),
        Err(e) => error_reply(&e),
    })
}

async fn handle_state(
    id: String,
    coordinator: MemoryCoordinator,
    req: StateRequest,
) -> std::result::Result<Response, Infallible> {
    Ok(match coordinator.update_state(&RegistrationId::new(id), req.state) {
        Ok(()) => empty_reply(StatusCode::NO_CONTENT),
        Err(e) => error_reply(&e),
    })
}

async fn handle_unregister(
    id: String,
    coordinator: MemoryCoordinator,
) -> std::result::Result<Response, Infallible> {
    Ok(match coordinator.unregister(&RegistrationId::new(id)) {
        Ok(()) => empty_reply(StatusCode::NO_CONTENT),
        Err(e) => error_reply(&e),
    })
}
