use std::time::Duration;

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::Body;
use hyper::Client;
use hyper::Method;
use hyper::Request;
use hyper::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::server::ErrorBody;
use super::server::MembersResponse;
use super::server::RegisterRequest;
use super::server::RegisterResponse;
use super::server::RevisionResponse;
use super::server::StateRequest;
use super::server::WatchResponse;
use super::validate_group;
use super::CoordinationBackend;
use super::CoordinationResult;
use super::InstanceState;
use super::RegistrationId;
use super::ServiceInstance;
use super::WatchStream;
use crate::CoordinationConfig;
use crate::CoordinationError;

/// [`CoordinationBackend`] speaking to a [`super::CoordinatorServer`] over HTTP.
///
/// Watches are long polls carrying the last seen group revision, so a
/// notification issued between two polls is never lost.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client<HttpConnector>,
    base_url: String,
    request_timeout: Duration,
    watch_timeout: Duration,
}

impl RemoteBackend {
    pub fn new(config: &CoordinationConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);
        Self {
            client: Client::builder().build(connector),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            watch_timeout: config.watch_timeout(),
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        deadline: Duration,
    ) -> CoordinationResult<(StatusCode, Bytes)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path));
        let body = match body {
            Some(bytes) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .map_err(|e| CoordinationError::Protocol(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;
            Ok((status, body))
        };
        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| CoordinationError::Timeout(deadline))?
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
        deadline: Duration,
        id: Option<&RegistrationId>,
    ) -> CoordinationResult<T> {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| CoordinationError::Protocol(e.to_string()))?;
        let (status, bytes) = self.call(method, path, body, deadline).await?;
        if !status.is_success() {
            return Err(decode_error(status, &bytes, id));
        }
        serde_json::from_slice(&bytes).map_err(|e| CoordinationError::Protocol(e.to_string()))
    }

    async fn no_content(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        let (status, bytes) = self.call(method, path, body, self.request_timeout).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(decode_error(status, &bytes, Some(id)))
        }
    }

    async fn poll(
        &self,
        group: &str,
        since: u64,
    ) -> CoordinationResult<WatchResponse> {
        let path = format!(
            "/v1/watch?group={}&since={}&timeout_ms={}",
            group,
            since,
            self.watch_timeout.as_millis()
        );
        self.json(
            Method::GET,
            &path,
            None::<&()>,
            self.watch_timeout + self.request_timeout,
            None,
        )
        .await
    }
}

fn decode_error(
    status: StatusCode,
    bytes: &[u8],
    id: Option<&RegistrationId>,
) -> CoordinationError {
    let body: Option<ErrorBody> = serde_json::from_slice(bytes).ok();
    match (status, id, body) {
        (StatusCode::NOT_FOUND, Some(id), _) => CoordinationError::LeaseNotFound(id.clone()),
        (StatusCode::SERVICE_UNAVAILABLE, _, body) => CoordinationError::Unreachable(
            body.map(|b| b.message).unwrap_or_else(|| status.to_string()),
        ),
        (_, _, Some(body)) if body.error == "invalid_group" => CoordinationError::InvalidGroup(body.message),
        (_, _, body) => CoordinationError::Protocol(format!(
            "unexpected status {status}: {}",
            body.map(|b| b.message).unwrap_or_default()
        )),
    }
}

#[async_trait::async_trait]
impl CoordinationBackend for RemoteBackend {
    async fn connect(&self) -> CoordinationResult<()> {
        let _: String = self
            .json(Method::GET, "/v1/ping", None::<&()>, self.request_timeout, None)
            .await?;
        Ok(())
    }

    async fn register_ephemeral(
        &self,
        group: &str,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> CoordinationResult<RegistrationId> {
        let request = RegisterRequest {
            group: group.to_string(),
            host: host.to_string(),
            port,
            ttl_ms: ttl.as_millis() as u64,
        };
        let response: RegisterResponse = self
            .json(Method::POST, "/v1/members", Some(&request), self.request_timeout, None)
            .await?;
        Ok(response.registration_id)
    }

    async fn renew(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.no_content(Method::POST, &format!("/v1/leases/{id}/renew"), None, id)
            .await
    }

    async fn update_state(
        &self,
        id: &RegistrationId,
        state: InstanceState,
    ) -> CoordinationResult<()> {
        let body = serde_json::to_vec(&StateRequest { state })
            .map_err(|e| CoordinationError::Protocol(e.to_string()))?;
        self.no_content(Method::PUT, &format!("/v1/leases/{id}/state"), Some(body), id)
            .await
    }

    async fn unregister(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()> {
        self.no_content(Method::DELETE, &format!("/v1/leases/{id}"), None, id)
            .await
    }

    async fn list_members(
        &self,
        group: &str,
    ) -> CoordinationResult<Vec<ServiceInstance>> {
        validate_group(group)?;
        let response: MembersResponse = self
            .json(
                Method::GET,
                &format!("/v1/members?group={group}"),
                None::<&()>,
                self.request_timeout,
                None,
            )
            .await?;
        Ok(response.members)
    }

    async fn watch(
        &self,
        group: &str,
    ) -> CoordinationResult<WatchStream> {
        validate_group(group)?;
        let RevisionResponse { revision } = self
            .json(
                Method::GET,
                &format!("/v1/revision?group={group}"),
                None::<&()>,
                self.request_timeout,
                None,
            )
            .await?;

        let backend = self.clone();
        let group = group.to_string();
        let stream = futures::stream::unfold(revision, move |mut since| {
            let backend = backend.clone();
            let group = group.clone();
            async move {
                loop {
                    match backend.poll(&group, since).await {
                        Ok(response) if response.resync => {
                            debug!(%group, since, "watch window exceeded; asking for resync");
                            return Some((Vec::new(), response.revision));
                        }
                        Ok(response) if !response.events.is_empty() => {
                            return Some((response.events, response.revision));
                        }
                        Ok(response) => since = response.revision,
                        Err(e) => {
                            warn!(%group, error = %e, "remote watch ended");
                            return None;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
