use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http::StatusCode;
use mockall::Sequence;
use tracing_test::traced_test;

use super::*;
use crate::coordination::InstanceState;
use crate::coordination::RegistrationId;
use crate::coordination::ServiceInstance;
use crate::discovery::snapshot_channel;
use crate::discovery::Snapshot;
use crate::discovery::SnapshotPublisher;
use crate::listener::ListenerMetaIndex;
use crate::Endpoint;
use crate::ListenerConfig;
use crate::RoutingError;
use crate::TransportError;
use crate::TransportErrorKind;

const LISTENER: &str = "127.0.0.1:8080";

fn instance(host: &str) -> ServiceInstance {
    ServiceInstance {
        group: "apps".to_string(),
        host: host.to_string(),
        port: 80,
        registration_id: RegistrationId::new(host),
        state: InstanceState::Online,
    }
}

fn ep(host: &str) -> Endpoint {
    Endpoint::new(host, 80)
}

fn refused() -> TransportError {
    TransportError::new(TransportErrorKind::ConnectRefused, "connection refused")
}

struct Fixture {
    publisher: SnapshotPublisher,
    index: Arc<ListenerMetaIndex>,
}

fn fixture(
    hosts: &[&str],
    configure: impl FnOnce(&mut ListenerConfig),
) -> Fixture {
    let members = hosts.iter().map(|h| instance(h)).collect();
    let (publisher, reader) = snapshot_channel(Snapshot::new("apps", 0, members, false));
    let mut config = ListenerConfig::new(LISTENER, "apps");
    config.cooldown_base_ms = 100;
    config.cooldown_cap_ms = 1000;
    configure(&mut config);
    let index = ListenerMetaIndex::build_with(&[config], |_| reader.clone()).unwrap();
    Fixture {
        publisher,
        index: Arc::new(index),
    }
}

fn engine(
    fixture: &Fixture,
    transport: MockTransport,
) -> ForwardingEngine {
    ForwardingEngine::new(fixture.index.clone(), Arc::new(transport))
}

fn balancer(fixture: &Fixture) -> &crate::balancer::Balancer {
    fixture.index.get(LISTENER).unwrap().servers.balancer()
}

fn get() -> ProxyRequest {
    ProxyRequest::new(Method::GET, "/orders")
}

#[tokio::test]
async fn test_unknown_listener_fails_only_that_request() {
    let fixture = fixture(&["a"], |_| {});
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .times(1)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::OK, "ok")));
    let engine = engine(&fixture, transport);

    let err = engine.forward("127.0.0.1:9999", &get()).await.unwrap_err();
    assert!(matches!(err, RoutingError::UnknownListener(ref addr) if addr == "127.0.0.1:9999"));

    assert!(engine.forward(LISTENER, &get()).await.is_ok());
}

#[tokio::test]
async fn test_no_healthy_backends_is_not_retried() {
    let fixture = fixture(&[], |_| {});
    let mut transport = MockTransport::new();
    transport.expect_send().never();
    let engine = engine(&fixture, transport);

    let err = engine.forward(LISTENER, &get()).await.unwrap_err();
    assert!(matches!(err, RoutingError::NoHealthyBackends { ref group } if group == "apps"));
}

#[tokio::test]
async fn test_forward_proxy_listener_requires_a_target() {
    let fixture = fixture(&["fp-1"], |config| config.backend_kind = crate::BackendKind::ForwardProxy);
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|endpoint, request| *endpoint == ep("fp-1") && request.target.is_some())
        .times(1)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::OK, "relayed")));
    let engine = engine(&fixture, transport);

    let err = engine.forward(LISTENER, &get()).await.unwrap_err();
    assert!(matches!(err, RoutingError::MissingTarget(ref addr) if addr == LISTENER));
    assert!(!balancer(&fixture).is_cooling(&ep("fp-1")));

    let proxied = get().with_target("origin.test".parse().unwrap());
    assert!(engine.forward(LISTENER, &proxied).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_success_returns_backend_response_and_clears_failures() {
    let fixture = fixture(&["a"], |_| {});
    balancer(&fixture).report_failure(&ep("a"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|endpoint, request| endpoint.host == "a" && request.path_and_query == "/orders")
        .times(1)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::CREATED, "done")));
    let engine = engine(&fixture, transport);

    let response = engine.forward(LISTENER, &get()).await.unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(&response.body[..], b"done");

    // A fresh failure starts over at the base cooldown.
    balancer(&fixture).report_failure(&ep("a"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!balancer(&fixture).is_cooling(&ep("a")));
}

#[tokio::test]
async fn test_backend_error_status_is_not_a_transport_failure() {
    let fixture = fixture(&["a", "b"], |_| {});
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .times(1)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom")));
    let engine = engine(&fixture, transport);

    let response = engine.forward(LISTENER, &get()).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!balancer(&fixture).is_cooling(&ep("a")));
}

#[tokio::test]
#[traced_test]
async fn test_failure_retries_on_another_endpoint() {
    let fixture = fixture(&["a", "b", "c"], |_| {});
    let mut seq = Sequence::new();
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|endpoint, _| endpoint.host == "a")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(refused()));
    transport
        .expect_send()
        .withf(|endpoint, _| endpoint.host == "b")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::OK, "from b")));
    let engine = engine(&fixture, transport);

    let response = engine.forward(LISTENER, &get()).await.unwrap();
    assert_eq!(&response.body[..], b"from b");
    assert!(balancer(&fixture).is_cooling(&ep("a")));
    assert!(!balancer(&fixture).is_cooling(&ep("b")));
    assert!(logs_contain("forwarding attempt failed"));
}

#[tokio::test]
async fn test_exhausted_budget_reports_causes_in_order() {
    let fixture = fixture(&["a", "b", "c", "d"], |config| config.retry_budget = 2);
    let mut transport = MockTransport::new();
    let kinds = [
        TransportErrorKind::ConnectRefused,
        TransportErrorKind::Timeout,
        TransportErrorKind::Reset,
    ];
    let mut calls = 0usize;
    transport.expect_send().times(3).returning(move |_, _| {
        let kind = kinds[calls];
        calls += 1;
        Err(TransportError::new(kind, "down"))
    });
    let engine = engine(&fixture, transport);

    let err = engine.forward(LISTENER, &get()).await.unwrap_err();
    let (listener, causes) = match err {
        RoutingError::Failed { listener, causes } => (listener, causes),
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(listener, LISTENER);
    let endpoints: Vec<&str> = causes.iter().map(|c| c.endpoint.host.as_str()).collect();
    assert_eq!(endpoints, vec!["a", "b", "c"]);
    let observed: Vec<TransportErrorKind> = causes.iter().map(|c| c.error.kind).collect();
    assert_eq!(observed, kinds.to_vec());
    assert!(!balancer(&fixture).is_cooling(&ep("d")));
}

#[tokio::test]
async fn test_running_out_of_candidates_fails_with_causes() {
    let fixture = fixture(&["a", "b"], |config| config.retry_budget = 5);
    let mut transport = MockTransport::new();
    transport.expect_send().times(2).returning(|_, _| Err(refused()));
    let engine = engine(&fixture, transport);

    match engine.forward(LISTENER, &get()).await {
        Err(RoutingError::Failed { causes, .. }) => assert_eq!(causes.len(), 2),
        other => panic!("expected Failed, got {other:?}"),
    }

    // Both endpoints now cool down: the next request fails fast.
    assert!(matches!(
        engine.forward(LISTENER, &get()).await,
        Err(RoutingError::NoHealthyBackends { .. })
    ));
}

#[tokio::test]
async fn test_non_idempotent_request_gets_single_attempt() {
    let fixture = fixture(&["a", "b"], |_| {});
    let mut transport = MockTransport::new();
    transport.expect_send().times(1).returning(|_, _| Err(refused()));
    let engine = engine(&fixture, transport);

    let post = ProxyRequest::new(Method::POST, "/orders").with_body("{}");
    match engine.forward(LISTENER, &post).await {
        Err(RoutingError::Failed { causes, .. }) => assert_eq!(causes.len(), 1),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_idempotent_retry_when_listener_allows_it() {
    let fixture = fixture(&["a", "b"], |config| config.retry_non_idempotent = true);
    let mut seq = Sequence::new();
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(refused()));
    transport
        .expect_send()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, request| Ok(ProxyResponse::new(StatusCode::OK, request.body.clone())));
    let engine = engine(&fixture, transport);

    let post = ProxyRequest::new(Method::POST, "/orders").with_body("payload");
    let response = engine.forward(LISTENER, &post).await.unwrap();
    assert_eq!(&response.body[..], b"payload");
}

#[tokio::test]
async fn test_zero_budget_means_one_attempt() {
    let fixture = fixture(&["a", "b"], |config| config.retry_budget = 0);
    let mut transport = MockTransport::new();
    transport.expect_send().times(1).returning(|_, _| Err(refused()));
    let engine = engine(&fixture, transport);

    assert!(matches!(
        engine.forward(LISTENER, &get()).await,
        Err(RoutingError::Failed { .. })
    ));
}

#[tokio::test]
async fn test_requests_follow_snapshot_replacement() {
    let fixture = fixture(&["a", "b"], |_| {});
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .returning(|endpoint, _| Ok(ProxyResponse::new(StatusCode::OK, endpoint.host.clone())));
    let engine = engine(&fixture, transport);

    let mut hits: HashMap<String, usize> = HashMap::new();
    for _ in 0..10 {
        let response = engine.forward(LISTENER, &get()).await.unwrap();
        *hits.entry(String::from_utf8_lossy(&response.body).into_owned()).or_insert(0) += 1;
    }
    assert_eq!(hits["a"], 5);
    assert_eq!(hits["b"], 5);

    fixture
        .publisher
        .publish(Snapshot::new("apps", 1, vec![instance("b")], false));
    for _ in 0..10 {
        let response = engine.forward(LISTENER, &get()).await.unwrap();
        assert_eq!(&response.body[..], b"b");
    }
}

/// Never answers; used to cancel a forward mid-flight.
struct HangingTransport;

#[async_trait::async_trait]
impl Transport for HangingTransport {
    async fn send(
        &self,
        _endpoint: &Endpoint,
        _request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_cancelled_forward_leaves_cooldown_untouched() {
    let fixture = fixture(&["a"], |_| {});
    let engine = ForwardingEngine::new(fixture.index.clone(), Arc::new(HangingTransport));

    let result = tokio::time::timeout(Duration::from_millis(50), engine.forward(LISTENER, &get())).await;
    assert!(result.is_err());

    assert!(!balancer(&fixture).is_cooling(&ep("a")));
    assert_eq!(balancer(&fixture).healthy_count(), 1);
    assert!(logs_contain("forward cancelled"));
}
