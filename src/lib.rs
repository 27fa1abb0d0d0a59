//! # noxy
//!
//! A reverse proxy whose backend pool is discovered at runtime.
//!
//! Backends announce themselves as lease-backed members of a named group in a
//! shared coordination service ([`membership::MembershipRegistrar`]). Each
//! proxy listener targets one group: a [`discovery::DiscoveryWatcher`] keeps an
//! immutable, versioned snapshot of the group, a [`balancer::Balancer`] picks
//! an endpoint per request, and the [`routing::ForwardingEngine`] forwards
//! with retry and per-endpoint cooldown.
//!
//! [`NodeBuilder`] wires the pieces together from [`Settings`].

pub mod admin;
pub mod balancer;
pub mod coordination;
pub mod discovery;
pub mod listener;
pub mod membership;
pub mod metrics;
pub mod routing;

mod config;
mod errors;
mod node;
pub(crate) mod utils;

pub use balancer::Endpoint;
pub use config::*;
pub use coordination::RegistrationId;
pub use errors::*;
pub use node::*;
