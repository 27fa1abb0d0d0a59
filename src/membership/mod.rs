//! Lease-backed registration of this process's endpoints.
//!
//! A backend process announces `host:port` in a group through the
//! [`MembershipRegistrar`]. Each registration gets its own renewal task; a
//! lost lease is replaced by a fresh registration, and persistent failures are
//! surfaced as [`RegistrarHealth`] rather than as errors.

mod registrar;
pub use registrar::*;
