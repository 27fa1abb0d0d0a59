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
use super::ProxyRequest;
use super::ProxyResponse;
use super::Transport;
use crate::Endpoint;
use crate::Result;

const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Serialize)]
struct ForwardErrorBody {
    error: &'static str,
    message: String,
}

/// Plain-HTTP forward proxy.
///
/// Each request is relayed to the host it names, taken from the
/// absolute-form URI or the `Host` header, and the answer is passed back.
/// There is no backend pool here: the target is the endpoint.
#[derive(Clone)]
pub struct ForwardProxyServer {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ForwardProxyServer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ForwardProxyServer").finish_non_exhaustive()
    }
}

impl ForwardProxyServer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn routes(&self) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
        let transport = self.transport.clone();
        let query = warp::query::raw().or(warp::any().map(String::new)).unify();
        let target = warp::host::optional().or(warp::any().map(|| None)).unify();

        warp::method()
            .and(warp::path::full())
            .and(query)
            .and(target)
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .and(warp::any().map(move || transport.clone()))
            .and_then(handle_forward)
    }

    /// Binds `addr` and serves until `shutdown` fires.
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
        info!(%bound, "forward proxy listening");
        Ok((bound, server))
    }
}

/// The endpoint a proxy request names. Only plain HTTP targets are relayed.
pub(crate) fn target_endpoint(authority: &Authority) -> Endpoint {
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Endpoint::new(host, authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT))
}

async fn handle_forward(
    method: Method,
    path: FullPath,
    query: String,
    target: Option<Authority>,
    mut headers: HeaderMap,
    body: Bytes,
    transport: Arc<dyn Transport>,
) -> std::result::Result<Response, Infallible> {
    let Some(authority) = target else {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "missing_target",
            "request names no target host".to_string(),
        ));
    };
    strip_hop_by_hop(&mut headers);
    let path_and_query = if query.is_empty() {
        path.as_str().to_string()
    } else {
        format!("{}?{}", path.as_str(), query)
    };
    let endpoint = target_endpoint(&authority);
    let request = ProxyRequest {
        method,
        path_and_query,
        headers,
        body,
        target: None,
    };

    Ok(match transport.send(&endpoint, &request).await {
        Ok(ProxyResponse {
            status,
            mut headers,
            body,
        }) => {
            strip_hop_by_hop(&mut headers);
            let mut reply = Response::new(Body::from(body));
            *reply.status_mut() = status;
            *reply.headers_mut() = headers;
            reply
        }
        Err(e) => {
            debug!(%endpoint, error = %e, "target unreachable");
            error_reply(StatusCode::BAD_GATEWAY, "target_unreachable", e.to_string())
        }
    })
}

fn error_reply(
    status: StatusCode,
    error: &'static str,
    message: String,
) -> Response {
    warp::reply::with_status(warp::reply::json(&ForwardErrorBody { error, message }), status).into_response()
}
