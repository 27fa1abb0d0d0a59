use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;

use super::*;
use crate::CoordinationConfig;
use crate::CoordinationError;
use crate::CoordinationMode;

const TTL: Duration = Duration::from_secs(30);

async fn start_server() -> (MemoryCoordinator, RemoteBackend, watch::Sender<()>) {
    let coordinator = MemoryCoordinator::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let (addr, server) = CoordinatorServer::new(coordinator.clone())
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)), shutdown_rx)
        .unwrap();
    tokio::spawn(server);

    let config = CoordinationConfig {
        mode: CoordinationMode::Remote,
        endpoint: format!("http://{addr}"),
        watch_timeout_ms: 200,
        ..Default::default()
    };
    (coordinator, RemoteBackend::new(&config), shutdown_tx)
}

#[tokio::test]
async fn test_remote_register_list_and_unregister() {
    let (coordinator, backend, _shutdown) = start_server().await;
    backend.connect().await.unwrap();

    let id = backend
        .register_ephemeral("proxies/eu", "10.0.0.1", 3128, TTL)
        .await
        .unwrap();
    let members = backend.list_members("proxies/eu").await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].registration_id, id);
    assert_eq!(coordinator.lease_count(), 1);

    backend.update_state(&id, InstanceState::Draining).await.unwrap();
    assert_eq!(
        coordinator.members("proxies/eu").unwrap()[0].state,
        InstanceState::Draining
    );

    backend.renew(&id).await.unwrap();
    backend.unregister(&id).await.unwrap();
    assert!(backend.list_members("proxies/eu").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_unknown_lease_maps_to_lease_not_found() {
    let (_coordinator, backend, _shutdown) = start_server().await;
    let id = RegistrationId::new("missing");

    assert!(matches!(
        backend.renew(&id).await,
        Err(CoordinationError::LeaseNotFound(ref got)) if *got == id
    ));
    assert!(matches!(
        backend.unregister(&id).await,
        Err(CoordinationError::LeaseNotFound(_))
    ));
}

#[tokio::test]
async fn test_remote_watch_delivers_changes_after_subscribe() {
    let (coordinator, backend, _shutdown) = start_server().await;
    let mut stream = backend.watch("apps").await.unwrap();

    coordinator.register("apps", "10.0.0.1", 80, TTL).unwrap();
    let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].kind, EventKind::Added);
}

#[tokio::test]
async fn test_remote_unreachable_server() {
    let config = CoordinationConfig {
        mode: CoordinationMode::Remote,
        endpoint: "http://127.0.0.1:1".to_string(),
        ..Default::default()
    };
    let backend = RemoteBackend::new(&config);

    let err = backend.connect().await.unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_server_rejects_malformed_group_in_watch_and_revision() {
    let coordinator = MemoryCoordinator::new();
    let routes = CoordinatorServer::new(coordinator.clone()).routes();

    for path in ["/v1/watch?group=a//b&since=0&timeout_ms=10", "/v1/revision?group=/apps"] {
        let response = warp::test::request().path(path).reply(&routes).await;

        assert_eq!(response.status(), 400, "{}", path);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "invalid_group");
    }

    let response = warp::test::request()
        .path("/v1/watch?group=apps&since=0&timeout_ms=10")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 200);
}
