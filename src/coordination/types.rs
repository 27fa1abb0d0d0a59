use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::Endpoint;

/// Opaque lease identifier issued by the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(String);

impl RegistrationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn generate() -> Self {
        Self(nanoid::nanoid!(16))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a registered instance accepts new traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Online,
    /// Known to the group but excluded from selection
    Draining,
}

/// One registered member of a group. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub group: String,
    pub host: String,
    pub port: u16,
    pub registration_id: RegistrationId,
    #[serde(default)]
    pub state: InstanceState,
}

impl ServiceInstance {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn is_online(&self) -> bool {
        self.state == InstanceState::Online
    }

    /// Ordering key of instances inside a snapshot.
    pub(crate) fn sort_key(&self) -> (&str, u16, &str) {
        (&self.host, self.port, self.registration_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Removed,
    Updated,
}

/// A membership change notification for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub group: String,
    pub kind: EventKind,
    pub instance: ServiceInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Sorts instances into snapshot order.
pub(crate) fn sort_instances(instances: &mut [ServiceInstance]) {
    instances.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}
