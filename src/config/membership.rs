use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::coordination::validate_group;
use crate::Error;
use crate::Result;

/// Lease and renewal parameters for the membership registrar.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MembershipConfig {
    /// Lease time-to-live granted by the coordination service
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Renewal period; must be strictly shorter than the TTL
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    /// Consecutive renewal failures after which the lease is treated as lost
    #[serde(default = "default_lost_after_failures")]
    pub lost_after_failures: u32,

    /// Consecutive failures (renewals and re-registrations) before the
    /// registrar reports a fatal health signal
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            lost_after_failures: default_lost_after_failures(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl MembershipConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_ms == 0 {
            return Err(Error::InvalidConfig("membership.lease_ttl_ms must be > 0".into()));
        }
        if self.renew_interval_ms == 0 || self.renew_interval_ms >= self.lease_ttl_ms {
            return Err(Error::InvalidConfig(format!(
                "membership.renew_interval_ms ({}) must be in (0, lease_ttl_ms = {})",
                self.renew_interval_ms, self.lease_ttl_ms
            )));
        }
        if self.lost_after_failures == 0 {
            return Err(Error::InvalidConfig(
                "membership.lost_after_failures must be >= 1".into(),
            ));
        }
        if self.max_consecutive_failures < self.lost_after_failures {
            return Err(Error::InvalidConfig(format!(
                "membership.max_consecutive_failures ({}) must be >= lost_after_failures ({})",
                self.max_consecutive_failures, self.lost_after_failures
            )));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

/// An endpoint this process announces into a group at startup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub group: String,
    pub host: String,
    pub port: u16,
}

impl RegistrationConfig {
    pub fn validate(&self) -> Result<()> {
        validate_group(&self.group).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if self.host.is_empty() || self.port == 0 {
            return Err(Error::InvalidConfig(format!(
                "registration {}:{} in group {} needs a host and a non-zero port",
                self.host, self.port, self.group
            )));
        }
        Ok(())
    }
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}
fn default_renew_interval_ms() -> u64 {
    3_000
}
fn default_lost_after_failures() -> u32 {
    2
}
fn default_max_consecutive_failures() -> u32 {
    10
}
