use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::*;
use crate::coordination::CoordinationClient;
use crate::coordination::MemoryCoordinator;
use crate::BackoffPolicy;
use crate::DiscoveryConfig;

fn registry(coordinator: &MemoryCoordinator) -> (Arc<CoordinationClient>, DiscoveryRegistry) {
    let client = CoordinationClient::new(Arc::new(coordinator.session()), BackoffPolicy::default());
    let registry = DiscoveryRegistry::new(client.clone(), DiscoveryConfig::default());
    (client, registry)
}

#[tokio::test]
async fn test_one_watcher_per_group() {
    let coordinator = MemoryCoordinator::new();
    let (_client, mut registry) = registry(&coordinator);

    let a = registry.reader("apps");
    let b = registry.reader("apps");
    registry.reader("proxies");

    assert!(Arc::ptr_eq(&a.load(), &b.load()));
    assert_eq!(registry.groups().collect::<Vec<_>>(), vec!["apps", "proxies"]);
    assert_eq!(registry.health().len(), 2);
    assert!(registry.status("apps").is_some());
    assert!(registry.status("missing").is_none());
}

#[tokio::test]
async fn test_spawn_starts_each_watcher_once() {
    let coordinator = MemoryCoordinator::new();
    coordinator
        .register("apps", "10.0.0.1", 80, Duration::from_secs(60))
        .unwrap();
    let (client, mut registry) = registry(&coordinator);
    let reader = registry.reader("apps");
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    client.spawn_supervisor(shutdown_rx.clone());

    let handles = registry.spawn(shutdown_rx.clone());
    assert_eq!(handles.len(), 1);
    assert!(registry.spawn(shutdown_rx).is_empty());

    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.load().is_stale() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reader.load().len(), 1);

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
