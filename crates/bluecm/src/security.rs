//! Security collaborator interface.
//!
//! Incoming connections on a registered channel require a security
//! registration for the lifetime of that channel. The manager calls
//! `register_incoming` exactly once when the channel becomes connectable and
//! `deregister_incoming` exactly once when the terminal disconnect cleanup
//! runs.

use crate::l2cap::Psm;
use crate::types::ServerChannel;

/// The protocol a security registration is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityProtocol {
    Rfcomm(ServerChannel),
    L2cap(Psm),
}

pub trait SecurityManager {
    fn register_incoming(&mut self, protocol: SecurityProtocol);
    fn deregister_incoming(&mut self, protocol: SecurityProtocol);
}

/// Default collaborator: accepts every registration silently.
#[derive(Debug, Default)]
pub struct NullSecurityManager;

impl SecurityManager for NullSecurityManager {
    fn register_incoming(&mut self, _protocol: SecurityProtocol) {}
    fn deregister_incoming(&mut self, _protocol: SecurityProtocol) {}
}
