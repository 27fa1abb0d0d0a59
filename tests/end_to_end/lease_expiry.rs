use std::collections::HashMap;
use std::time::Duration;

use hyper::StatusCode;
use noxy::coordination::MemoryCoordinator;
use noxy::NodeBuilder;
use noxy::RegistrationConfig;
use tokio::sync::watch;

use crate::common::get;
use crate::common::listener_status;
use crate::common::proxy_settings;
use crate::common::spawn_backend;
use crate::common::wait_until;
use crate::common::PROXY_LISTENER;

/// Two backends join the group, one of them stops renewing and its lease
/// lapses: traffic moves to the survivor without a single 503.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_traffic_follows_membership_changes() {
    let a = spawn_backend("a");
    let b = spawn_backend("b");
    let coordinator = MemoryCoordinator::new();

    let mut settings = proxy_settings("apps");
    settings.registrations = vec![RegistrationConfig {
        group: "apps".to_string(),
        host: a.address.ip().to_string(),
        port: a.address.port(),
    }];
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let node = NodeBuilder::init(settings, shutdown_rx)
        .memory_coordinator(coordinator.clone())
        .build()
        .await
        .unwrap();
    let proxy = node.proxy_address(PROXY_LISTENER).unwrap();
    let admin = node.admin_address().unwrap();

    // Registered behind the node's back and never renewed.
    coordinator
        .register(
            "apps",
            &b.address.ip().to_string(),
            b.address.port(),
            Duration::from_millis(1500),
        )
        .unwrap();

    assert!(wait_until(|| async { listener_status(admin).await.online_server_count == 2 }).await);

    let mut hits: HashMap<String, usize> = HashMap::new();
    for _ in 0..10 {
        let (status, body) = get(proxy, "/").await;
        assert_eq!(status, StatusCode::OK);
        *hits.entry(body).or_default() += 1;
    }
    assert_eq!(hits.get("a"), Some(&5));
    assert_eq!(hits.get("b"), Some(&5));

    assert!(wait_until(|| async { listener_status(admin).await.online_server_count == 1 }).await);

    for _ in 0..10 {
        let (status, body) = get(proxy, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "a");
    }

    node.shutdown().await;
    assert_eq!(coordinator.lease_count(), 0);
}
