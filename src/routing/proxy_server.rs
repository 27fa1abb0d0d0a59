use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::uri::Authority;
use http::HeaderMap;
use http::Method;
use hyper::Body;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use warp::filters::path::FullPath;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Reply;

use super::strip_hop_by_hop;
use super::ForwardingEngine;
use super::ProxyRequest;
use super::ProxyResponse;
use crate::BackendKind;
use crate::Error;
use crate::Result;
use crate::RoutingError;

#[derive(Debug, Serialize)]
struct ProxyErrorBody {
    error: &'static str,
    message: String,
}

/// HTTP front of one listener. Every request it accepts is forwarded under
/// the listener's configured address.
///
/// When the listener's backends are forward proxies, the request's target
/// authority (absolute-form URI or `Host` header) travels with it.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    listen_address: String,
    backend_kind: BackendKind,
    engine: Arc<ForwardingEngine>,
}

impl ProxyServer {
    pub fn new(
        listen_address: impl Into<String>,
        engine: Arc<ForwardingEngine>,
    ) -> Self {
        let listen_address = listen_address.into();
        let backend_kind = engine
            .listeners()
            .get(&listen_address)
            .map(|entry| entry.meta.backend_kind)
            .unwrap_or_default();
        Self {
            listen_address,
            backend_kind,
            engine,
        }
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub fn routes(&self) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
        let listener = self.listen_address.clone();
        let engine = self.engine.clone();
        let backend_kind = self.backend_kind;
        let query = warp::query::raw().or(warp::any().map(String::new)).unify();
        // A malformed or conflicting Host is treated as absent.
        let target = warp::host::optional()
            .or(warp::any().map(|| None))
            .unify()
            .map(move |authority: Option<Authority>| match backend_kind {
                BackendKind::Origin => None,
                BackendKind::ForwardProxy => authority,
            });

        warp::method()
            .and(warp::path::full())
            .and(query)
            .and(target)
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and(warp::any().map(move || listener.clone()))
            .and(warp::any().map(move || engine.clone()))
            .and_then(handle_proxy)
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub fn bind(
        &self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send + 'static)> {
        let addr: SocketAddr = self
            .listen_address
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("listen address {}: {}", self.listen_address, e)))?;
        let (bound, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;
        info!(listener = %self.listen_address, %bound, "proxy listening");
        Ok((bound, server))
    }
}

async fn handle_proxy(
    method: Method,
    path: FullPath,
    query: String,
    target: Option<Authority>,
    mut headers: HeaderMap,
    body: Bytes,
    listen_address: String,
    engine: Arc<ForwardingEngine>,
) -> std::result::Result<Response, Infallible> {
    strip_hop_by_hop(&mut headers);
    let path_and_query = if query.is_empty() {
        path.as_str().to_string()
    } else {
        format!("{}?{}", path.as_str(), query)
    };
    let request = ProxyRequest {
        method,
        path_and_query,
        headers,
        body,
        target,
    };

    Ok(match engine.forward(&listen_address, &request).await {
        Ok(response) => into_reply(response),
        Err(e) => {
            debug!(listener = %listen_address, error = %e, "request not forwarded");
            routing_error_reply(&e)
        }
    })
}

fn into_reply(response: ProxyResponse) -> Response {
    let ProxyResponse {
        status,
        mut headers,
        body,
    } = response;
    strip_hop_by_hop(&mut headers);
    let mut reply = Response::new(Body::from(body));
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}

pub(crate) fn status_for(error: &RoutingError) -> StatusCode {
    match error {
        RoutingError::UnknownListener(_) => StatusCode::MISDIRECTED_REQUEST,
        RoutingError::MissingTarget(_) => StatusCode::BAD_REQUEST,
        RoutingError::NoHealthyBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RoutingError::Failed { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn routing_error_reply(error: &RoutingError) -> Response {
    let kind = match error {
        RoutingError::UnknownListener(_) => "unknown_listener",
        RoutingError::MissingTarget(_) => "missing_target",
        RoutingError::NoHealthyBackends { .. } => "no_healthy_backends",
        RoutingError::Failed { .. } => "forwarding_failed",
    };
    let body = ProxyErrorBody {
        error: kind,
        message: error.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status_for(error)).into_response()
}
