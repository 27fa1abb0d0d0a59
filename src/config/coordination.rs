use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Which coordination backend the process talks to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// Host the coordination service in this process
    Embedded,
    /// Talk to a coordination service hosted elsewhere over HTTP
    Remote,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default = "default_mode")]
    pub mode: CoordinationMode,

    /// Base URL of the remote coordination service, e.g. `http://10.0.0.5:7000`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// When embedded, optionally expose the service to other processes here
    #[serde(default)]
    pub serve_address: Option<SocketAddr>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Long-poll window for remote watches
    #[serde(default = "default_watch_timeout_ms")]
    pub watch_timeout_ms: u64,

    /// How often the embedded service sweeps expired leases
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Reconnect policy for the shared coordination handle
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            endpoint: default_endpoint(),
            serve_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            watch_timeout_ms: default_watch_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            reconnect: default_reconnect(),
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == CoordinationMode::Remote && !self.endpoint.starts_with("http://") {
            return Err(Error::InvalidConfig(format!(
                "coordination.endpoint must be an http:// URL in remote mode, got {}",
                self.endpoint
            )));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "coordination timeouts must be greater than 0".into(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "coordination.reap_interval_ms must be greater than 0".into(),
            ));
        }
        self.reconnect.validate("coordination.reconnect")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

fn default_mode() -> CoordinationMode {
    CoordinationMode::Embedded
}
fn default_endpoint() -> String {
    "http://127.0.0.1:7000".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_watch_timeout_ms() -> u64 {
    30_000
}
fn default_reap_interval_ms() -> u64 {
    500
}
fn default_reconnect() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms: 100,
        max_delay_ms: 5000,
    }
}
