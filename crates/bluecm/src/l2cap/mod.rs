//! L2CAP connection engine.
//!
//! Mirrors the RFCOMM engine's state-machine shape: outgoing connect,
//! incoming accept and release, driven by controller confirmations and by
//! requests routed through the service-manager serializer. Additionally
//! owns PSM registration, including unregistration deferred through the
//! pending-request queue, and fills the per-ACL extended-features cache.

mod engine;
mod types;

#[cfg(test)]
mod tests;

pub use types::{L2capConnection, L2capElement, L2capState, L2capVariables, Psm, PsmRegistration};

pub(crate) use engine::*;
