//! bluecm - the Connection Manager core of a Bluetooth host stack
//!
//! This library owns every ACL (physical link), RFCOMM, L2CAP and SCO/eSCO
//! connection to remote devices, serializes the single command channel to
//! the device controller, and drives each connection through its lifecycle
//! in response to asynchronous controller confirmations.
//!
//! The manager is single-threaded and event-driven: the host feeds it
//! application [`Request`]s and [`ControllerEvent`]s, one at a time, and
//! drains the resulting [`ControllerCommand`]s and upstream [`CmEvent`]s
//! from the context's queues. A handler that must wait for a controller
//! confirmation returns immediately after recording state; the
//! continuation is a later handler matched by kind and correlating key.

pub mod acl;
pub mod bnep;
pub mod context;
pub mod controller;
pub mod devutil;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod l2cap;
pub mod pending;
pub mod rfc;
pub mod sco;
pub mod security;
pub mod serializer;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export common types for convenience
pub use context::CmContext;
pub use controller::{ControllerCommand, ControllerEvent};
pub use dispatch::{Request, SubsystemClass};
pub use error::{CmError, CmResult};
pub use events::CmEvent;
pub use types::{AppHandle, BdAddr, Role, Transport, TypedAddr};
