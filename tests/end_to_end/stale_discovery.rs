use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use noxy::admin::HealthReport;
use noxy::admin::OverallHealth;
use noxy::coordination::MemoryCoordinator;
use noxy::NodeBuilder;
use tokio::sync::watch;

use crate::common::get;
use crate::common::listener_status;
use crate::common::proxy_settings;
use crate::common::spawn_backend;
use crate::common::wait_until;
use crate::common::PROXY_LISTENER;

/// Losing the coordination session keeps the last known backends in
/// rotation; the view is flagged stale until the session comes back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partition_serves_last_known_snapshot() {
    let a = spawn_backend("a");
    let coordinator = MemoryCoordinator::new();
    let session = Arc::new(coordinator.session());
    coordinator
        .register(
            "apps",
            &a.address.ip().to_string(),
            a.address.port(),
            Duration::from_secs(600),
        )
        .unwrap();

    let mut settings = proxy_settings("apps");
    settings.coordination.reconnect.base_delay_ms = 20;
    settings.coordination.reconnect.max_delay_ms = 200;
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let node = NodeBuilder::init(settings, shutdown_rx)
        .coordination_backend(session.clone())
        .build()
        .await
        .unwrap();
    let proxy = node.proxy_address(PROXY_LISTENER).unwrap();
    let admin = node.admin_address().unwrap();

    assert!(wait_until(|| async {
        let status = listener_status(admin).await;
        status.online_server_count == 1 && !status.stale
    })
    .await);

    session.partition();
    assert!(wait_until(|| async { listener_status(admin).await.stale }).await);

    let status = listener_status(admin).await;
    assert_eq!(status.online_server_count, 1);
    let (code, body) = get(proxy, "/").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, "a");

    let (code, body) = get(admin, "/health").await;
    assert_eq!(code, StatusCode::OK);
    let report: HealthReport = serde_json::from_str(&body).unwrap();
    assert_eq!(report.status, OverallHealth::Degraded);

    session.heal();
    assert!(wait_until(|| async { !listener_status(admin).await.stale }).await);
    assert_eq!(listener_status(admin).await.online_server_count, 1);

    node.shutdown().await;
}
