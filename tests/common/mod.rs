use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::to_bytes;
use hyper::client::conn;
use hyper::Body;
use hyper::Client;
use hyper::Request;
use hyper::StatusCode;
use hyper::Uri;
use noxy::admin::ListenerStatus;
use noxy::ListenerConfig;
use noxy::Settings;
use tokio::net::TcpStream;
use tokio::sync::watch;
use warp::Filter;

pub const PROXY_LISTENER: &str = "127.0.0.1:0";

// Generous: discovery and lease expiry run on real time here.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// An HTTP backend answering every request with its own name.
pub struct EchoBackend {
    pub address: SocketAddr,
    _stop: watch::Sender<()>,
}

pub fn spawn_backend(name: &'static str) -> EchoBackend {
    let (stop, mut stopped) = watch::channel(());
    let route = warp::any().map(move || name);
    let (address, server) = warp::serve(route).bind_with_graceful_shutdown(([127, 0, 0, 1], 0), async move {
        let _ = stopped.changed().await;
    });
    tokio::spawn(server);
    EchoBackend { address, _stop: stop }
}

/// Proxy settings with one listener on `group` and the admin surface on an
/// ephemeral port.
pub fn proxy_settings(group: &str) -> Settings {
    let mut settings = Settings::default();
    settings.admin.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));
    settings.coordination.reap_interval_ms = 50;
    settings.listeners = vec![ListenerConfig::new(PROXY_LISTENER, group)];
    settings
}

pub async fn get(
    address: SocketAddr,
    path: &str,
) -> (StatusCode, String) {
    let uri = format!("http://{}{}", address, path).parse().unwrap();
    let response = Client::new().get(uri).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// GET `url` through the proxy at `proxy`, written in absolute-form the way
/// an HTTP client configured with a proxy sends it.
pub async fn get_via_proxy(
    proxy: SocketAddr,
    url: &str,
) -> (StatusCode, String) {
    let uri: Uri = url.parse().unwrap();
    let host = uri.authority().unwrap().to_string();
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, connection) = conn::handshake(stream).await.unwrap();
    tokio::spawn(connection);
    let request = Request::get(uri).header("host", host).body(Body::empty()).unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

pub async fn listener_status(admin: SocketAddr) -> ListenerStatus {
    let (status, body) = get(admin, "/status").await;
    assert_eq!(status, StatusCode::OK);
    let mut listeners: Vec<ListenerStatus> = serde_json::from_str(&body).unwrap();
    assert_eq!(listeners.len(), 1);
    listeners.remove(0)
}

/// Polls `condition` every 20ms until it holds or `WAIT_TIMEOUT` passes.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
