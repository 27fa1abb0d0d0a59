//! Error hierarchy for the discovery and routing pipeline.
//!
//! Errors are grouped by the layer that raises them: the coordination adapter,
//! the membership registrar, and the routing engine. Discovery staleness is not
//! an error; it is carried as a flag on the published snapshot.

use std::fmt;
use std::time::Duration;

use config::ConfigError;

use crate::Endpoint;
use crate::RegistrationId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration source or deserialization failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration values that parse but violate a rule
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Coordination service failures that escaped local handling
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Membership registration failures
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Per-request routing failures
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Socket binding and other local I/O failures
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    /// The coordination service cannot be reached (or the session is partitioned)
    #[error("Coordination service unreachable: {0}")]
    Unreachable(String),

    /// The lease is unknown to the service: expired, evicted or never granted
    #[error("Lease {0} not found")]
    LeaseNotFound(RegistrationId),

    /// The group path is malformed
    #[error("Invalid group path: {0:?}")]
    InvalidGroup(String),

    /// The service answered with something this client does not understand
    #[error("Coordination protocol error: {0}")]
    Protocol(String),

    /// The call did not complete within its deadline
    #[error("Coordination call timed out after {0:?}")]
    Timeout(Duration),
}

impl CoordinationError {
    /// Whether the failure says something about the connection rather than the
    /// request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid group path: {0:?}")]
    InvalidGroup(String),

    #[error("Failed to register in group {group}: {source}")]
    Unreachable {
        group: String,
        #[source]
        source: CoordinationError,
    },

    #[error("Unknown registration {0}")]
    UnknownRegistration(RegistrationId),

    #[error("Failed to deregister {id}: {source}")]
    Deregister {
        id: RegistrationId,
        #[source]
        source: CoordinationError,
    },

    #[error("Failed to update registration {id}: {source}")]
    Update {
        id: RegistrationId,
        #[source]
        source: CoordinationError,
    },
}

/// Transport-level failure classes. All of them are retried the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    ConnectRefused,
    Timeout,
    Reset,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRefused => "connect_refused",
            Self::Timeout => "timeout",
            Self::Reset => "reset",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One failed forwarding attempt, kept for the aggregated cause list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub endpoint: Endpoint,
    pub error: TransportError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.error)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    /// No listener is registered under the inbound address
    #[error("No listener bound to {0}")]
    UnknownListener(String),

    /// A forward-proxy listener got a request without a target host
    #[error("Request to {0} names no target host")]
    MissingTarget(String),

    /// Every known instance of the group is cooling down, draining or absent
    #[error("No healthy backends in group {group}")]
    NoHealthyBackends { group: String },

    /// The retry budget ran out; causes are in attempt order
    #[error("Forwarding failed after {} attempt(s): {}", .causes.len(), join_causes(.causes))]
    Failed {
        listener: String,
        causes: Vec<AttemptFailure>,
    },
}

fn join_causes(causes: &[AttemptFailure]) -> String {
    causes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
