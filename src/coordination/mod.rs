//! Coordination service adapter.
//!
//! Everything above this module talks to the coordination service through one
//! shared [`CoordinationClient`]. The client wraps a [`CoordinationBackend`],
//! tracks the connection state, and owns the single reconnect path.
//!
//! Two backends are provided:
//! - [`MemorySession`]: a session on an in-process [`MemoryCoordinator`]
//! - [`RemoteBackend`]: HTTP client for a [`CoordinatorServer`] in another process
//!
//! Watches are streams of event batches. An empty batch means "something
//! changed, resynchronize"; the end of the stream means the session was lost.

mod client;
mod group;
mod memory;
mod remote;
mod server;
mod types;

pub use client::*;
pub use group::*;
pub use memory::*;
pub use remote::*;
pub use server::*;
pub use types::*;

#[cfg(test)]
mod client_test;
#[cfg(test)]
mod remote_test;

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
#[cfg(test)]
use mockall::automock;

use crate::CoordinationError;

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Stream of membership event batches for one group.
pub type WatchStream = Pin<Box<dyn Stream<Item = Vec<MembershipEvent>> + Send>>;

#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Establishes (or re-establishes) the session.
    async fn connect(&self) -> CoordinationResult<()>;

    /// Registers an ephemeral member that disappears when its lease lapses.
    async fn register_ephemeral(
        &self,
        group: &str,
        host: &str,
        port: u16,
        ttl: Duration,
    ) -> CoordinationResult<RegistrationId>;

    /// Extends the lease by its TTL.
    async fn renew(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()>;

    async fn update_state(
        &self,
        id: &RegistrationId,
        state: InstanceState,
    ) -> CoordinationResult<()>;

    async fn unregister(
        &self,
        id: &RegistrationId,
    ) -> CoordinationResult<()>;

    async fn list_members(
        &self,
        group: &str,
    ) -> CoordinationResult<Vec<ServiceInstance>>;

    /// Subscribes to changes of `group`. Changes that happen after this call
    /// returns are guaranteed to be delivered on the stream.
    async fn watch(
        &self,
        group: &str,
    ) -> CoordinationResult<WatchStream>;
}
