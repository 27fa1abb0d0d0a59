use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

use http::header::HOST;
use http::HeaderValue;
use hyper::client::conn;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper::Client;
use hyper::Request;
use hyper::Response;
use tokio::net::TcpStream;
use tracing::debug;

use super::strip_hop_by_hop;
use super::ProxyRequest;
use super::ProxyResponse;
use super::Transport;
use crate::Endpoint;
use crate::TransportConfig;
use crate::TransportError;
use crate::TransportErrorKind;

/// HTTP/1.1 [`Transport`] over a pooled hyper client.
///
/// Requests carrying a target go to forward-proxy backends: they are written
/// in absolute-form on a connection of their own, since the pooled client
/// would connect to the target instead of the proxy.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);
        let client = Client::builder()
            .pool_idle_timeout(config.pool_idle_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(connector);
        Self {
            client,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// `http://{endpoint}{path}` for origin backends, `http://{target}{path}`
    /// (with a matching `Host`) when the request names a target.
    pub(crate) fn build_request(
        endpoint: &Endpoint,
        request: &ProxyRequest,
    ) -> Result<Request<Body>, TransportError> {
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let uri = match &request.target {
            Some(target) => {
                let host = HeaderValue::from_str(target.as_str())
                    .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
                headers.insert(HOST, host);
                format!("http://{}{}", target, request.path_and_query)
            }
            None => format!("http://{}{}", endpoint, request.path_and_query),
        };

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        if let Some(target) = builder.headers_mut() {
            target.extend(headers);
        }
        builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))
    }

    /// One request over a fresh connection to the forward proxy at `endpoint`.
    async fn send_through_proxy(
        &self,
        endpoint: &Endpoint,
        outbound: Request<Body>,
    ) -> Result<Response<Body>, TransportError> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            TransportError::new(
                TransportErrorKind::Timeout,
                format!("connect to {} timed out after {:?}", endpoint, self.connect_timeout),
            )
        })?
        .map_err(|e| TransportError::new(classify_io(e.kind()).unwrap_or(TransportErrorKind::Other), e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (mut sender, connection) = conn::handshake(stream).await.map_err(from_hyper)?;
        let peer = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(proxy = %peer, error = %e, "forward proxy connection closed");
            }
        });
        sender.send_request(outbound).await.map_err(from_hyper)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError> {
        let outbound = Self::build_request(endpoint, request)?;

        let exchange = async {
            let response = if request.target.is_some() {
                self.send_through_proxy(endpoint, outbound).await?
            } else {
                self.client.request(outbound).await.map_err(from_hyper)?
            };
            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body).await.map_err(from_hyper)?;
            let mut headers = parts.headers;
            strip_hop_by_hop(&mut headers);
            Ok::<_, TransportError>(ProxyResponse {
                status: parts.status,
                headers,
                body,
            })
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("no response from {} within {:?}", endpoint, self.request_timeout),
                )
            })?
    }
}

fn from_hyper(err: hyper::Error) -> TransportError {
    TransportError::new(classify(&err), err.to_string())
}

/// Maps a hyper failure onto the retry-relevant kinds, looking through the
/// source chain for the underlying socket error.
pub(crate) fn classify(err: &hyper::Error) -> TransportErrorKind {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(kind) = e.downcast_ref::<std::io::Error>().and_then(|io| classify_io(io.kind())) {
            return kind;
        }
        source = e.source();
    }
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        TransportErrorKind::Reset
    } else {
        TransportErrorKind::Other
    }
}

fn classify_io(kind: ErrorKind) -> Option<TransportErrorKind> {
    match kind {
        ErrorKind::ConnectionRefused => Some(TransportErrorKind::ConnectRefused),
        ErrorKind::TimedOut => Some(TransportErrorKind::Timeout),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            Some(TransportErrorKind::Reset)
        }
        _ => None,
    }
}
