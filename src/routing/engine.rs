use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::ProxyRequest;
use super::ProxyResponse;
use super::Transport;
use crate::listener::ListenerMetaIndex;
use crate::metrics::FORWARDED_REQUESTS;
use crate::metrics::FORWARD_ATTEMPT_FAILURES;
use crate::metrics::FORWARD_LATENCY_MS;
use crate::AttemptFailure;
use crate::BackendKind;
use crate::Endpoint;
use crate::RoutingError;

/// Per-request forwarding progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardState {
    Received,
    Resolved,
    Selected(Endpoint),
    Forwarding(Endpoint),
    Retrying { attempt: u32 },
    Succeeded(Endpoint),
    Failed,
}

/// Binds requests to listeners and drives them through selection, forwarding
/// and retry.
pub struct ForwardingEngine {
    listeners: Arc<ListenerMetaIndex>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ForwardingEngine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ForwardingEngine {
    pub fn new(
        listeners: Arc<ListenerMetaIndex>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { listeners, transport }
    }

    pub fn listeners(&self) -> &Arc<ListenerMetaIndex> {
        &self.listeners
    }

    /// Forwards `request` received on `listen_address`.
    ///
    /// Transport failures put the endpoint into cooldown and the request is
    /// retried on an endpoint not yet tried, up to the listener's retry budget.
    /// Non-idempotent requests get a single attempt unless the listener opts
    /// in. Dropping the returned future mid-flight leaves the balancer's
    /// failure bookkeeping untouched.
    pub async fn forward(
        &self,
        listen_address: &str,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, RoutingError> {
        let mut progress = RequestProgress::new(listen_address);
        progress.transition(ForwardState::Received);

        let Some(entry) = self.listeners.get(listen_address) else {
            progress.finish("unknown_listener");
            return Err(RoutingError::UnknownListener(listen_address.to_string()));
        };
        progress.transition(ForwardState::Resolved);

        let meta = &entry.meta;
        if meta.backend_kind == BackendKind::ForwardProxy && request.target.is_none() {
            progress.finish("missing_target");
            return Err(RoutingError::MissingTarget(listen_address.to_string()));
        }
        let balancer = entry.servers.balancer();
        let max_attempts = if request.is_idempotent() || meta.retry_non_idempotent {
            meta.retry_budget.saturating_add(1)
        } else {
            1
        };

        let mut tried: Vec<Endpoint> = Vec::new();
        let mut causes: Vec<AttemptFailure> = Vec::new();
        loop {
            let endpoint = match balancer.select_excluding(&tried) {
                Ok(endpoint) => endpoint,
                Err(e) if causes.is_empty() => {
                    progress.finish("no_healthy_backends");
                    return Err(e);
                }
                Err(_) => {
                    debug!(listener = %listen_address, "no untried endpoint left");
                    break;
                }
            };
            progress.transition(ForwardState::Selected(endpoint.clone()));
            progress.transition(ForwardState::Forwarding(endpoint.clone()));

            match self.transport.send(&endpoint, request).await {
                Ok(response) => {
                    balancer.report_success(&endpoint);
                    progress.transition(ForwardState::Succeeded(endpoint));
                    progress.finish("success");
                    return Ok(response);
                }
                Err(error) => {
                    warn!(
                        listener = %listen_address,
                        %endpoint,
                        ?error,
                        "forwarding attempt failed"
                    );
                    FORWARD_ATTEMPT_FAILURES
                        .with_label_values(&[listen_address, error.kind.as_str()])
                        .inc();
                    balancer.report_failure(&endpoint);
                    tried.push(endpoint.clone());
                    causes.push(AttemptFailure { endpoint, error });
                }
            }

            let attempts = causes.len() as u32;
            if attempts >= max_attempts {
                break;
            }
            progress.transition(ForwardState::Retrying { attempt: attempts + 1 });
        }

        progress.transition(ForwardState::Failed);
        progress.finish("failed");
        Err(RoutingError::Failed {
            listener: listen_address.to_string(),
            causes,
        })
    }
}

/// Tracks one request; records its outcome when finished, or `cancelled`
/// when dropped before that.
struct RequestProgress<'a> {
    listener: &'a str,
    started: Instant,
    state: ForwardState,
    finished: bool,
}

impl<'a> RequestProgress<'a> {
    fn new(listener: &'a str) -> Self {
        Self {
            listener,
            started: Instant::now(),
            state: ForwardState::Received,
            finished: false,
        }
    }

    fn transition(
        &mut self,
        next: ForwardState,
    ) {
        trace!(listener = %self.listener, from = ?self.state, to = ?next, "forward state");
        self.state = next;
    }

    fn finish(
        &mut self,
        outcome: &str,
    ) {
        self.finished = true;
        self.record(outcome);
    }

    fn record(
        &self,
        outcome: &str,
    ) {
        FORWARDED_REQUESTS.with_label_values(&[self.listener, outcome]).inc();
        FORWARD_LATENCY_MS
            .with_label_values(&[self.listener])
            .observe(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Drop for RequestProgress<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(listener = %self.listener, state = ?self.state, "forward cancelled");
            self.record("cancelled");
        }
    }
}
