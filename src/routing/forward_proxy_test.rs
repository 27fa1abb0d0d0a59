use std::sync::Arc;

use http::uri::Authority;
use http::StatusCode;

use super::*;
use crate::Endpoint;
use crate::TransportError;
use crate::TransportErrorKind;

fn server(transport: MockTransport) -> ForwardProxyServer {
    ForwardProxyServer::new(Arc::new(transport))
}

#[tokio::test]
async fn test_relays_to_the_named_host() {
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|endpoint, request| {
            *endpoint == Endpoint::new("origin.test", 9000)
                && request.path_and_query == "/news?page=2"
                && request.target.is_none()
                && request.headers.get("proxy-connection").is_none()
        })
        .times(1)
        .returning(|_, _| Ok(ProxyResponse::new(StatusCode::OK, "front page")));

    let response = warp::test::request()
        .path("/news?page=2")
        .header("host", "origin.test:9000")
        .header("proxy-connection", "keep-alive")
        .reply(&server(transport).routes())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"front page");
}

#[tokio::test]
async fn test_missing_host_is_rejected() {
    let mut transport = MockTransport::new();
    transport.expect_send().never();

    let response = warp::test::request().path("/").reply(&server(transport).routes()).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], "missing_target");
}

#[tokio::test]
async fn test_unreachable_target_maps_to_502() {
    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .times(1)
        .returning(|_, _| Err(TransportError::new(TransportErrorKind::ConnectRefused, "connection refused")));

    let response = warp::test::request()
        .path("/")
        .header("host", "origin.test")
        .reply(&server(transport).routes())
        .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], "target_unreachable");
}

#[test]
fn test_target_endpoint_defaults_to_port_80() {
    let authority: Authority = "origin.test".parse().unwrap();
    assert_eq!(target_endpoint(&authority), Endpoint::new("origin.test", 80));

    let authority: Authority = "[::1]:8081".parse().unwrap();
    assert_eq!(target_endpoint(&authority), Endpoint::new("::1", 8081));
}
