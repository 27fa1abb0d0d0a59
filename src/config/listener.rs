use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::coordination::validate_group;
use crate::Error;
use crate::Result;

/// Endpoint selection policy of a listener.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    #[default]
    RoundRobin,
    Random,
}

/// What the members of a listener's target group are.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Origin servers; requests are sent in origin-form (`/path?query`)
    #[default]
    Origin,
    /// Forward proxies; requests keep their target and are sent in
    /// absolute-form (`http://host/path?query`)
    ForwardProxy,
}

/// One inbound listener and the group it forwards to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// `host:port` the proxy accepts on; also the key requests are resolved by
    pub listen_address: String,

    #[serde(alias = "target_group")]
    pub target_group_name: String,

    #[serde(default)]
    pub routing_policy: RoutingPolicy,

    /// Additional attempts after the first one
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    #[serde(default = "default_cooldown_cap_ms")]
    pub cooldown_cap_ms: u64,

    /// Allow retrying methods that are not idempotent (POST, PATCH, ...)
    #[serde(default)]
    pub retry_non_idempotent: bool,

    #[serde(default)]
    pub backend_kind: BackendKind,
}

impl ListenerConfig {
    pub fn new(
        listen_address: impl Into<String>,
        target_group_name: impl Into<String>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            target_group_name: target_group_name.into(),
            routing_policy: RoutingPolicy::default(),
            retry_budget: default_retry_budget(),
            cooldown_base_ms: default_cooldown_base_ms(),
            cooldown_cap_ms: default_cooldown_cap_ms(),
            retry_non_idempotent: false,
            backend_kind: BackendKind::default(),
        }
    }

    pub fn with_backend_kind(
        mut self,
        backend_kind: BackendKind,
    ) -> Self {
        self.backend_kind = backend_kind;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "listener address {:?} is not a valid host:port",
                self.listen_address
            )));
        }
        validate_group(&self.target_group_name).map_err(|e| {
            Error::InvalidConfig(format!("listener {}: {}", self.listen_address, e))
        })?;
        if self.cooldown_base_ms == 0 || self.cooldown_base_ms > self.cooldown_cap_ms {
            return Err(Error::InvalidConfig(format!(
                "listener {}: cooldown_base_ms ({}) must be in (0, cooldown_cap_ms = {}]",
                self.listen_address, self.cooldown_base_ms, self.cooldown_cap_ms
            )));
        }
        Ok(())
    }

    pub fn cooldown_base(&self) -> Duration {
        Duration::from_millis(self.cooldown_base_ms)
    }

    pub fn cooldown_cap(&self) -> Duration {
        Duration::from_millis(self.cooldown_cap_ms)
    }
}

fn default_retry_budget() -> u32 {
    2
}
fn default_cooldown_base_ms() -> u64 {
    1000
}
fn default_cooldown_cap_ms() -> u64 {
    30_000
}
