//! BNEP connection bookkeeping.
//!
//! Only the table needed for stakeholder accounting: BNEP connections count
//! toward `count_connections_to_peer` and therefore keep an ACL alive.

use crate::context::CmContext;
use crate::controller::{ControllerCommand, HciStatus, HCI_SUCCESS};
use crate::dispatch::{RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::types::{AppHandle, BdAddr};

pub const MAX_BNEP_CONNECTIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BnepState {
    #[default]
    Idle,
    Connect,
    Connected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BnepRecord {
    pub addr: BdAddr,
    pub state: BnepState,
}

#[derive(Debug, Default)]
pub struct BnepTable {
    records: [BnepRecord; MAX_BNEP_CONNECTIONS],
}

impl BnepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, addr: &BdAddr) -> Option<&BnepRecord> {
        self.records
            .iter()
            .find(|r| r.state != BnepState::Idle && r.addr == *addr)
    }

    pub fn find_mut(&mut self, addr: &BdAddr) -> Option<&mut BnepRecord> {
        self.records
            .iter_mut()
            .find(|r| r.state != BnepState::Idle && r.addr == *addr)
    }

    pub fn allocate(&mut self, addr: BdAddr) -> Option<&mut BnepRecord> {
        let slot = self.records.iter_mut().find(|r| r.state == BnepState::Idle)?;
        slot.addr = addr;
        slot.state = BnepState::Connect;
        Some(slot)
    }

    pub fn release(&mut self, addr: &BdAddr) {
        if let Some(rec) = self.find_mut(addr) {
            *rec = BnepRecord::default();
        }
    }

    /// Connected BNEP contributions toward the peer's stakeholder count.
    pub fn count_connected_to(&self, addr: &BdAddr) -> u8 {
        self.records
            .iter()
            .filter(|r| r.state == BnepState::Connected && r.addr == *addr)
            .count() as u8
    }
}

pub(crate) fn connect_req(cm: &mut CmContext, app: AppHandle, addr: BdAddr) {
    cm.sm.app_handle = app;

    if cm.bnep.find(&addr).is_some() {
        cm.send_event(CmEvent::BnepConnectCfm {
            app,
            addr,
            result: Err(CmError::AlreadyConnecting),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    if cm.bnep.allocate(addr).is_none() {
        cm.send_event(CmEvent::BnepConnectCfm {
            app,
            addr,
            result: Err(CmError::InternalError),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    crate::discovery::pause_for_paging(cm);
    cm.send_command(ControllerCommand::BnepConnect { addr });
}

pub(crate) fn connect_cfm(cm: &mut CmContext, addr: BdAddr, status: HciStatus) {
    if cm.sm.serializer.lock_token() != Some(RequestKind::BnepConnect) {
        cm.general_exception("bnep", "unexpected connect confirmation");
        return;
    }

    let app = cm.sm.app_handle;
    let result = if status == HCI_SUCCESS {
        if let Some(rec) = cm.bnep.find_mut(&addr) {
            rec.state = BnepState::Connected;
        }
        Ok(())
    } else {
        cm.bnep.release(&addr);
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::BnepConnectCfm { app, addr, result });
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn disconnect_req(cm: &mut CmContext, app: AppHandle, addr: BdAddr) {
    cm.sm.app_handle = app;

    if cm.bnep.find(&addr).is_none() {
        cm.send_event(CmEvent::BnepDisconnectInd {
            app,
            addr,
            reason: 0,
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    cm.send_command(ControllerCommand::BnepDisconnect { addr });
    // The disconnect indication carries the outcome for BNEP.
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn disconnect_ind(cm: &mut CmContext, addr: BdAddr, reason: HciStatus) {
    if cm.bnep.find(&addr).is_none() {
        return;
    }
    cm.bnep.release(&addr);
    let app = cm.sm.app_handle;
    cm.send_event(CmEvent::BnepDisconnectInd { app, addr, reason });
}
