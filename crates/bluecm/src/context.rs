//! The Connection Manager context.
//!
//! One value holds the entire manager state: the connection tables, the
//! three subsystem serializers, the pending-request queue and the command
//! and event queues. It is created once at process start, passed by
//! mutable reference into every handler, and torn down at shutdown. There
//! is no other instance and no interior locking: a single cooperative
//! task owns it, and handlers run to completion one message at a time.
//!
//! External callers must not hold references to table entries across a
//! handler invocation: a later event may free or relocate them. Correlate
//! by device address, element id or connection id instead.

use std::collections::VecDeque;

use log::{debug, warn};

use crate::acl::AclTable;
use crate::bnep::BnepTable;
use crate::controller::ControllerCommand;
use crate::devutil::{DeviceUtility, DeviceUtilityEvent, NullDeviceUtility};
use crate::discovery::{InquiryAppState, InquiryDmState, InquiryParams};
use crate::error::{CmError, CmResult};
use crate::events::CmEvent;
use crate::pending::PendingQueue;
use crate::l2cap::L2capVariables;
use crate::rfc::RfcVariables;
use crate::sco::{PcmSlotTable, ScoNegotiation};
use crate::security::{NullSecurityManager, SecurityManager, SecurityProtocol};
use crate::serializer::Serializer;
use crate::types::{AppHandle, BdAddr, ElementId, ServerChannel};

/// State of the current ACL attempt, distinct from the per-slot records
/// that persist across link instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmState {
    #[default]
    Null,
    ConnectInit,
    Connect,
}

/// Device-manager subsystem state.
#[derive(Debug)]
pub struct DmVariables {
    pub serializer: Serializer,
    pub state: DmState,
    /// Requester of the device-management command in flight.
    pub app_handle: AppHandle,
    /// Local LMP feature bitmap; everything supported until told otherwise.
    pub local_features: [u8; 8],
    /// The one in-flight synchronous negotiation.
    pub sco_negotiation: Option<ScoNegotiation>,
}

impl Default for DmVariables {
    fn default() -> Self {
        Self {
            serializer: Serializer::new("dm"),
            state: DmState::Null,
            app_handle: AppHandle::INVALID,
            local_features: [0xFF; 8],
            sco_negotiation: None,
        }
    }
}

/// Service-manager subsystem state.
#[derive(Debug)]
pub struct SmVariables {
    pub serializer: Serializer,
    /// Requester of the service command in flight.
    pub app_handle: AppHandle,
    /// Address the in-flight service command operates on.
    pub operating_addr: BdAddr,
    pub context: u16,
    pub registering_channel: ServerChannel,
}

impl Default for SmVariables {
    fn default() -> Self {
        Self {
            serializer: Serializer::new("sm"),
            app_handle: AppHandle::INVALID,
            operating_addr: BdAddr::ZERO,
            context: 0,
            registering_channel: 0,
        }
    }
}

/// Discovery subsystem state.
#[derive(Debug)]
pub struct DiscoveryVariables {
    pub serializer: Serializer,
    pub app_state: InquiryAppState,
    pub dm_state: InquiryDmState,
    /// Application receiving inquiry results.
    pub app: AppHandle,
    /// Application that asked for the cancel in flight.
    pub cancel_app: AppHandle,
    pub params: InquiryParams,
}

impl Default for DiscoveryVariables {
    fn default() -> Self {
        Self {
            serializer: Serializer::new("sdc"),
            app_state: InquiryAppState::Idle,
            dm_state: InquiryDmState::Idle,
            app: AppHandle::INVALID,
            cancel_app: AppHandle::INVALID,
            params: InquiryParams::default(),
        }
    }
}

/// The whole Connection Manager.
pub struct CmContext {
    pub(crate) dm: DmVariables,
    pub(crate) sm: SmVariables,
    pub(crate) discovery: DiscoveryVariables,

    pub(crate) acl: AclTable,
    pub(crate) rfc: RfcVariables,
    pub(crate) l2cap: L2capVariables,
    pub(crate) bnep: BnepTable,

    pub(crate) pending: PendingQueue,
    pub(crate) pcm: PcmSlotTable,

    element_counter: u8,

    commands: VecDeque<ControllerCommand>,
    events: VecDeque<CmEvent>,

    device_utility: Box<dyn DeviceUtility>,
    security: Box<dyn SecurityManager>,
}

impl Default for CmContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CmContext {
    pub fn new() -> Self {
        Self {
            dm: DmVariables::default(),
            sm: SmVariables::default(),
            discovery: DiscoveryVariables::default(),
            acl: AclTable::new(),
            rfc: RfcVariables::default(),
            l2cap: L2capVariables::default(),
            bnep: BnepTable::new(),
            pending: PendingQueue::new(),
            pcm: PcmSlotTable::new(),
            element_counter: 0,
            commands: VecDeque::new(),
            events: VecDeque::new(),
            device_utility: Box::new(NullDeviceUtility),
            security: Box::new(NullSecurityManager),
        }
    }

    /// Replaces the device-utility collaborator.
    pub fn with_device_utility(mut self, utility: Box<dyn DeviceUtility>) -> Self {
        self.device_utility = utility;
        self
    }

    /// Replaces the security collaborator.
    pub fn with_security_manager(mut self, security: Box<dyn SecurityManager>) -> Self {
        self.security = security;
        self
    }

    /// Sets the local LMP feature bitmap (normally read from the
    /// controller at startup).
    pub fn set_local_features(&mut self, features: [u8; 8]) {
        self.dm.local_features = features;
    }

    /// Read-only access to the ACL table for hosts and tests.
    pub fn acl_table(&self) -> &AclTable {
        &self.acl
    }

    /// Stakeholder count for a peer; see the ACL engine for the summands.
    pub fn count_connections_to_peer(&self, addr: &BdAddr) -> u8 {
        crate::acl::count_connections_to_peer(self, addr)
    }

    /// Marks a GATT connection active (or gone) on the link. An active
    /// GATT connection is a stakeholder and keeps the ACL up.
    pub fn set_gatt_connection_active(&mut self, addr: &BdAddr, active: bool) -> CmResult<()> {
        match self.acl.find_mut(addr) {
            Some(record) => {
                record.gatt_active = active;
                Ok(())
            }
            None => Err(CmError::UnknownConnection),
        }
    }

    /// Next outgoing controller command, if any.
    pub fn take_command(&mut self) -> Option<ControllerCommand> {
        self.commands.pop_front()
    }

    /// Next outbound application event, if any.
    pub fn take_event(&mut self) -> Option<CmEvent> {
        self.events.pop_front()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn send_command(&mut self, command: ControllerCommand) {
        debug!("-> controller: {:?}", command);
        self.commands.push_back(command);
    }

    pub(crate) fn send_event(&mut self, event: CmEvent) {
        debug!("-> app {}: {:?}", event.app(), event);
        self.events.push_back(event);
    }

    pub(crate) fn set_dm_state(&mut self, state: DmState) {
        debug!("dm state: {:?} -> {:?}", self.dm.state, state);
        self.dm.state = state;
    }

    /// Protocol-level inconsistency: logged and the message dropped. Never
    /// fatal; a confused connection is isolated, not the whole manager.
    pub(crate) fn general_exception(&self, module: &str, what: &str) {
        warn!(
            "general exception [{}]: {} (dm state {:?})",
            module, what, self.dm.state
        );
    }

    pub(crate) fn notify_device_utility(&mut self, event: DeviceUtilityEvent) -> bool {
        self.device_utility.handle(event)
    }

    pub(crate) fn register_security(&mut self, protocol: SecurityProtocol) {
        self.security.register_incoming(protocol);
    }

    pub(crate) fn deregister_security(&mut self, protocol: SecurityProtocol) {
        self.security.deregister_incoming(protocol);
    }

    /// Tells the device utility that a service-level channel is gone.
    pub(crate) fn notify_service_disconnected(&mut self, addr: BdAddr) {
        self.notify_device_utility(DeviceUtilityEvent::ServiceDisconnected { addr });
    }

    /// Distinct applications holding a connected channel on the link.
    pub(crate) fn apps_with_connections_to(&self, addr: &BdAddr) -> Vec<AppHandle> {
        let mut apps = Vec::new();
        let rfc_apps = self
            .rfc
            .elements
            .iter()
            .filter_map(|e| e.conn.as_ref())
            .filter(|c| c.is_connected() && c.addr == *addr)
            .map(|c| c.app);
        let l2cap_apps = self
            .l2cap
            .elements
            .iter()
            .filter_map(|e| e.conn.as_ref())
            .filter(|c| c.is_connected() && c.addr == *addr)
            .map(|c| c.app);
        for app in rfc_apps.chain(l2cap_apps) {
            if !apps.contains(&app) {
                apps.push(app);
            }
        }
        apps
    }

    /// Allocates an element id unique across the RFCOMM and L2CAP lists
    /// combined. Wraps within 1..=254 and skips ids still held by any
    /// element, freed instance or not.
    pub(crate) fn alloc_element_id(&mut self) -> CmResult<ElementId> {
        for _ in 0..u8::MAX {
            self.element_counter = self.element_counter.wrapping_add(1);
            if self.element_counter == u8::MAX || self.element_counter == 0 {
                self.element_counter = 1;
            }
            let candidate = ElementId(self.element_counter);
            let in_rfc = self.rfc.elements.iter().any(|e| e.id == candidate);
            let in_l2cap = self.l2cap.elements.iter().any(|e| e.id == candidate);
            if !in_rfc && !in_l2cap {
                return Ok(candidate);
            }
        }
        Err(CmError::InternalError)
    }

    /// House cleaning: drops elements whose instance has been freed. Runs
    /// on every service-manager restore.
    pub(crate) fn purge_unused_elements(&mut self) {
        self.rfc.purge_unused();
        self.l2cap.purge_unused();
    }
}
