//! Device-utility collaborator interface.
//!
//! An optional policy module that observes link lifecycle notifications and
//! may take over default handling (role-switch policy, cache maintenance).
//! Its absence degrades to the built-in defaults.

use crate::controller::HciStatus;
use crate::types::{BdAddr, LinkMode, Role};

/// Lifecycle notifications delivered to the device utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceUtilityEvent {
    AclOpened { addr: BdAddr, incoming: bool },
    AclClosed { addr: BdAddr, reason: HciStatus },
    ModeChange { addr: BdAddr, mode: LinkMode },
    RoleChange { addr: BdAddr, role: Role },
    ServiceDisconnected { addr: BdAddr },
}

/// Collaborator hook. Returning `true` from `handle` claims the event and
/// suppresses the manager's default handling for it.
pub trait DeviceUtility {
    fn handle(&mut self, event: DeviceUtilityEvent) -> bool;
}

/// Default collaborator: observes nothing, vetoes nothing.
#[derive(Debug, Default)]
pub struct NullDeviceUtility;

impl DeviceUtility for NullDeviceUtility {
    fn handle(&mut self, _event: DeviceUtilityEvent) -> bool {
        false
    }
}
