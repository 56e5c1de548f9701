//! RFCOMM connection engine.
//!
//! Per-channel state machines for outgoing connect, incoming accept and
//! release, layered on the ACL engine and the service-manager serializer.
//! Elements live in a list shared with nothing else, but their ids are
//! unique across the RFCOMM and L2CAP universes combined.

mod engine;
mod types;

#[cfg(test)]
mod tests;

pub use types::{RfcConnection, RfcElement, RfcState, RfcVariables, ScoLink};

pub(crate) use engine::*;
