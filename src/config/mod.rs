//! Configuration management for the proxy process.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`NOXY__SECTION__KEY`)
//! - Component-wise validation
mod coordination;
mod discovery;
mod forward_proxy;
mod listener;
mod membership;
mod monitoring;
mod retry;
mod transport;
pub use coordination::*;
pub use discovery::*;
pub use forward_proxy::*;
pub use listener::*;
pub use membership::*;
pub use monitoring::*;
pub use retry::*;
pub use transport::*;

use std::collections::HashSet;
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

const ENV_PREFIX: &str = "NOXY";

/// Main configuration container
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Coordination service backend and reconnect policy
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Lease and renewal parameters for registrations
    #[serde(default)]
    pub membership: MembershipConfig,
    /// Discovery watcher tuning
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Outbound forwarding client
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Inbound listeners; each forwards to one group
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Endpoints this process announces at startup
    #[serde(default)]
    pub registrations: Vec<RegistrationConfig>,
    #[serde(default)]
    pub forward_proxy: ForwardProxyConfig,
}

impl Settings {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources are merged in order, later ones overriding earlier:
    /// 1. Type defaults
    /// 2. Configuration file from `CONFIG_PATH` (if set)
    /// 3. Environment variables with the `NOXY__` prefix
    ///
    /// Callers must call `validate()` once all overrides are applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Environment variables are re-applied on top so they keep the highest
    /// priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.coordination.validate()?;
        self.membership.validate()?;
        self.discovery.validate()?;
        self.transport.validate()?;
        self.forward_proxy.validate()?;

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !seen.insert(listener.listen_address.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate listener address {}",
                    listener.listen_address
                )));
            }
        }
        for registration in &self.registrations {
            registration.validate()?;
        }
        Ok(self)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
