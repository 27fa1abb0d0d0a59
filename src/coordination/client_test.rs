use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::*;
use crate::BackoffPolicy;
use crate::CoordinationError;

fn fast_policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 100,
        base_delay_ms: 10,
        max_delay_ms: 40,
    }
}

#[tokio::test]
async fn test_client_starts_disconnected_and_connects() {
    let mut backend = MockCoordinationBackend::new();
    backend.expect_connect().times(1).returning(|| Ok(()));

    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.reconnect().await.unwrap();
    assert!(client.is_connected());

    // Already connected: no further connect call.
    client.reconnect().await.unwrap();
}

#[tokio::test]
async fn test_connectivity_failure_marks_disconnected() {
    let mut backend = MockCoordinationBackend::new();
    backend.expect_connect().returning(|| Ok(()));
    backend
        .expect_list_members()
        .times(1)
        .returning(|_| Err(CoordinationError::Unreachable("down".into())));

    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));
    client.reconnect().await.unwrap();

    let err = client.list_members("proxies").await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_lease_not_found_keeps_connection() {
    let mut backend = MockCoordinationBackend::new();
    backend.expect_connect().returning(|| Ok(()));
    backend
        .expect_renew()
        .times(1)
        .returning(|id| Err(CoordinationError::LeaseNotFound(id.clone())));

    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));
    client.reconnect().await.unwrap();

    let err = client.renew(&RegistrationId::new("gone")).await.unwrap_err();
    assert!(matches!(err, CoordinationError::LeaseNotFound(_)));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_invalid_group_never_reaches_backend() {
    // No expectations: any backend call would panic.
    let backend = MockCoordinationBackend::new();
    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));

    let err = client
        .register_ephemeral("/bad//group", "127.0.0.1", 80, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidGroup(_)));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_retry_budget() {
    let mut backend = MockCoordinationBackend::new();
    backend
        .expect_connect()
        .times(3)
        .returning(|| Err(CoordinationError::Unreachable("refused".into())));

    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));
    let err = client.reconnect().await.unwrap_err();

    assert!(matches!(err, CoordinationError::Unreachable(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_stops_during_backoff_after_exhausted_reconnect() {
    let mut backend = MockCoordinationBackend::new();
    backend
        .expect_connect()
        .returning(|| Err(CoordinationError::Unreachable("refused".into())));
    let policy = BackoffPolicy {
        max_retries: 1,
        timeout_ms: 100,
        base_delay_ms: 10,
        max_delay_ms: 3_600_000,
    };
    let client = CoordinationClient::new(Arc::new(backend), policy);
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let supervisor = client.spawn_supervisor(shutdown_rx);

    // Let the single attempt fail so the supervisor enters its backoff.
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor stops without waiting out the backoff cap")
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_reconnects_share_one_attempt() {
    let mut backend = MockCoordinationBackend::new();
    backend.expect_connect().times(1).returning(|| Ok(()));

    let client = CoordinationClient::new(Arc::new(backend), fast_policy(3));
    let (a, b) = tokio::join!(client.reconnect(), client.reconnect());

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_supervisor_reconnects_after_partition_heals() {
    let coordinator = MemoryCoordinator::new();
    let session = Arc::new(coordinator.session());
    let client = CoordinationClient::new(session.clone(), fast_policy(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let supervisor = client.spawn_supervisor(shutdown_rx);

    tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
        .await
        .expect("initial connect");

    session.partition();
    assert!(client.list_members("apps").await.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    session.heal();
    tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
        .await
        .expect("reconnect after heal");
    assert!(client.list_members("apps").await.unwrap().is_empty());

    shutdown_tx.send(()).unwrap();
    supervisor.await.unwrap();
}
