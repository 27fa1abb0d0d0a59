use std::net::SocketAddr;

use hyper::StatusCode;
use noxy::coordination::MemoryCoordinator;
use noxy::CoordinationMode;
use noxy::NodeBuilder;
use noxy::RegistrationConfig;
use noxy::Settings;
use tokio::sync::watch;

use crate::common::get;
use crate::common::listener_status;
use crate::common::proxy_settings;
use crate::common::spawn_backend;
use crate::common::wait_until;
use crate::common::PROXY_LISTENER;

/// Node A hosts the coordination service; node B reaches it over HTTP,
/// announces a backend there and proxies to it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_node_registers_and_discovers_through_http() {
    let backend = spawn_backend("remote");
    let coordinator = MemoryCoordinator::new();

    let mut hosting = Settings::default();
    hosting.admin.enabled = false;
    hosting.coordination.serve_address = Some(SocketAddr::from(([127, 0, 0, 1], 0)));
    let (_a_shutdown_tx, a_shutdown_rx) = watch::channel(());
    let node_a = NodeBuilder::init(hosting, a_shutdown_rx)
        .memory_coordinator(coordinator.clone())
        .build()
        .await
        .unwrap();
    let coordination = node_a.coordination_address().unwrap();

    let mut remote = proxy_settings("apps");
    remote.coordination.mode = CoordinationMode::Remote;
    remote.coordination.endpoint = format!("http://{}", coordination);
    remote.coordination.watch_timeout_ms = 1000;
    remote.registrations = vec![RegistrationConfig {
        group: "apps".to_string(),
        host: backend.address.ip().to_string(),
        port: backend.address.port(),
    }];
    let (_b_shutdown_tx, b_shutdown_rx) = watch::channel(());
    let node_b = NodeBuilder::init(remote, b_shutdown_rx).build().await.unwrap();
    assert!(node_b.coordinator().is_none());

    let members = coordinator.members("apps").unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].port, backend.address.port());

    let admin = node_b.admin_address().unwrap();
    assert!(wait_until(|| async { listener_status(admin).await.online_server_count == 1 }).await);

    let proxy = node_b.proxy_address(PROXY_LISTENER).unwrap();
    let (status, body) = get(proxy, "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "remote");

    node_b.shutdown().await;
    assert!(coordinator.members("apps").unwrap().is_empty());
    node_a.shutdown().await;
}
