//! Request forwarding: listener resolution, endpoint selection, retries and
//! the HTTP plumbing on both sides of the proxy.

mod engine;
mod forward_proxy;
mod http_transport;
mod proxy_server;
pub use engine::*;
pub use forward_proxy::*;
pub use http_transport::*;
pub use proxy_server::*;

#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod forward_proxy_test;

use bytes::Bytes;
use http::header;
use http::uri::Authority;
use http::HeaderMap;
use http::HeaderName;
use http::Method;
use http::StatusCode;
#[cfg(test)]
use mockall::automock;

use crate::Endpoint;
use crate::TransportError;

/// An inbound request, fully buffered, as handed to the transport.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Origin-form target, e.g. `/orders?id=7`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final destination when the backend is a forward proxy; the request
    /// is then sent in absolute-form `http://{target}{path_and_query}`
    pub target: Option<Authority>,
}

impl ProxyRequest {
    pub fn new(
        method: Method,
        path_and_query: impl Into<String>,
    ) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            target: None,
        }
    }

    pub fn with_target(
        mut self,
        target: Authority,
    ) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_body(
        mut self,
        body: impl Into<Bytes>,
    ) -> Self {
        self.body = body.into();
        self
    }

    /// Methods that may be replayed against another backend.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(
        status: StatusCode,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Sends one request to one endpoint. Any backend answer, whatever its
/// status, is a success; only failing to get an answer is an error.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError>;
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn strips_standard_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn idempotent_methods() {
        for method in [Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS] {
            assert!(ProxyRequest::new(method, "/").is_idempotent());
        }
        assert!(!ProxyRequest::new(Method::POST, "/").is_idempotent());
        assert!(!ProxyRequest::new(Method::PATCH, "/").is_idempotent());
    }
}
