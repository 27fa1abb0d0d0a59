use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::error;


lazy_static! {
    pub static ref FORWARDED_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("forwarded_requests", "Requests handled per listener and outcome"),
        &["listener", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref FORWARD_ATTEMPT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("forward_attempt_failures", "Failed forwarding attempts by transport error kind"),
        &["listener", "kind"]
    )
    .expect("metric can not be created");

    pub static ref FORWARD_LATENCY_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("forward_latency_ms", "End-to-end forwarding latency in ms")
            .buckets(exponential_buckets(1.0, 2.0, 16).expect("valid buckets")),
        &["listener"]
    )
    .expect("metric can not be created");

    pub static ref SNAPSHOT_PUBLISHES: IntCounterVec = IntCounterVec::new(
        Opts::new("snapshot_publishes", "Snapshots published per group, split by staleness"),
        &["group", "stale"]
    )
    .expect("metric can not be created");

    pub static ref ONLINE_SERVERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("online_servers", "Instances in the latest snapshot of a group"),
        &["group"]
    )
    .expect("metric can not be created");

    pub static ref RENEWAL_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("lease_renewal_failures", "Failed lease renewals and re-registrations"),
        &["group"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new_custom(Some("noxy".to_string()), None)
        .expect("registry can be created");
}

static REGISTER: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(FORWARDED_REQUESTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FORWARD_ATTEMPT_FAILURES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FORWARD_LATENCY_MS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SNAPSHOT_PUBLISHES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ONLINE_SERVERS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RENEWAL_FAILURES.clone()))
        .expect("collector can be registered");
}

/// Registers every collector with the process registry, once.
pub fn init() {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));
}

/// Prometheus text exposition of `registry`.
pub fn encode_text(registry: &Registry) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode metrics: {}", e);
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}

pub fn gather_text() -> String {
    init();
    encode_text(&REGISTRY)
}
