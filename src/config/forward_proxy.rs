use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;

use crate::coordination::validate_group;
use crate::Error;
use crate::Result;

/// Forward-proxy mode: this process relays proxy requests to their target and,
/// when `group` is set, announces itself as a member of that group so reverse
/// proxies can balance over it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ForwardProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Group to register in once the listener is bound
    #[serde(default)]
    pub group: Option<String>,

    /// Host announced to the group; defaults to the bound IP
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl Default for ForwardProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_listen_address(),
            group: None,
            advertise_host: None,
        }
    }
}

impl ForwardProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(group) = &self.group {
            validate_group(group).map_err(|e| Error::InvalidConfig(format!("forward_proxy.group: {}", e)))?;
            if self.advertise_host.is_none() && self.listen_address.ip().is_unspecified() {
                return Err(Error::InvalidConfig(format!(
                    "forward_proxy.advertise_host is required when listening on {}",
                    self.listen_address
                )));
            }
        }
        Ok(())
    }

    /// The host other processes should use to reach a listener bound at `bound`.
    pub fn advertised_host(
        &self,
        bound: SocketAddr,
    ) -> String {
        self.advertise_host
            .clone()
            .unwrap_or_else(|| bound.ip().to_string())
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8100))
}
