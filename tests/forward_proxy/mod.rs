use std::net::SocketAddr;
use std::sync::Arc;

use hyper::StatusCode;
use noxy::coordination::MemoryCoordinator;
use noxy::BackendKind;
use noxy::ListenerConfig;
use noxy::NodeBuilder;
use noxy::Settings;
use tokio::sync::watch;

use crate::common::get_via_proxy;
use crate::common::listener_status;
use crate::common::proxy_settings;
use crate::common::spawn_backend;
use crate::common::wait_until;
use crate::common::PROXY_LISTENER;

const GROUP: &str = "forward-proxies";

fn forward_proxy_settings() -> Settings {
    let mut settings = Settings::default();
    settings.admin.enabled = false;
    settings.forward_proxy.enabled = true;
    settings.forward_proxy.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));
    settings.forward_proxy.group = Some(GROUP.to_string());
    settings
}

/// A forward proxy joins its group on startup; a reverse proxy balancing
/// over that group relays a proxy request through it to the origin.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_reaches_origin_through_discovered_forward_proxy() {
    let origin = spawn_backend("CNN front page");
    let coordinator = MemoryCoordinator::new();

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let forwarder = NodeBuilder::init(forward_proxy_settings(), shutdown_rx.clone())
        .coordination_backend(Arc::new(coordinator.session()))
        .build()
        .await
        .unwrap();
    assert!(forwarder.forward_proxy_address().is_some());

    let mut settings = proxy_settings(GROUP);
    settings.listeners = vec![ListenerConfig::new(PROXY_LISTENER, GROUP).with_backend_kind(BackendKind::ForwardProxy)];
    let reverse = NodeBuilder::init(settings, shutdown_rx)
        .memory_coordinator(coordinator.clone())
        .build()
        .await
        .unwrap();
    let proxy = reverse.proxy_address(PROXY_LISTENER).unwrap();
    let admin = reverse.admin_address().unwrap();

    assert!(wait_until(|| async { listener_status(admin).await.online_server_count == 1 }).await);

    let url = format!("http://{}/world?edition=intl", origin.address);
    let (status, body) = get_via_proxy(proxy, &url).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("CNN"), "{}", body);

    forwarder.shutdown().await;
    assert!(wait_until(|| async { listener_status(admin).await.online_server_count == 0 }).await);

    let (status, _) = get_via_proxy(proxy, &url).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    reverse.shutdown().await;
    assert_eq!(coordinator.lease_count(), 0);
}
