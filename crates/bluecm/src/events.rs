//! Application-facing confirmations and indications.
//!
//! Handlers never call back into applications; they push owned `CmEvent`
//! values onto the context's outbound queue and the host loop delivers them.
//! Each event carries the handle of the application it is addressed to.

use crate::controller::HciStatus;
use crate::error::CmResult;
use crate::l2cap::Psm;
use crate::sco::SyncNegotiatedParams;
use crate::types::{
    AppHandle, BdAddr, ClassOfDevice, ConnId, LinkMode, Role, ScoHandle, ServerChannel, TypedAddr,
};

/// Upstream messages from the Connection Manager to applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    AclOpenCfm {
        app: AppHandle,
        addr: TypedAddr,
        result: CmResult<()>,
    },
    AclCloseCfm {
        app: AppHandle,
        addr: TypedAddr,
        reason: HciStatus,
    },
    RemoteVersionCfm {
        app: AppHandle,
        addr: BdAddr,
        lmp_version: u8,
        manufacturer: u16,
        lmp_subversion: u16,
        result: CmResult<()>,
    },
    LinkSupervisionTimeoutCfm {
        app: AppHandle,
        addr: BdAddr,
        result: CmResult<()>,
    },
    ModeChangeCfm {
        app: AppHandle,
        addr: BdAddr,
        mode: LinkMode,
        result: CmResult<()>,
    },
    ModeChangeInd {
        app: AppHandle,
        addr: BdAddr,
        mode: LinkMode,
        interval: u16,
    },
    RoleSwitchCfm {
        app: AppHandle,
        addr: BdAddr,
        role: Role,
        result: CmResult<()>,
    },
    RfcRegisterCfm {
        app: AppHandle,
        server_channel: ServerChannel,
        context: u16,
        result: CmResult<()>,
    },
    RfcConnectCfm {
        app: AppHandle,
        addr: BdAddr,
        server_channel: ServerChannel,
        conn_id: Option<ConnId>,
        context: u16,
        result: CmResult<()>,
    },
    /// Completion of an accept registration: an incoming connection was
    /// established on the registered server channel (or the registration
    /// ended with an error/cancel).
    RfcConnectAcceptCfm {
        app: AppHandle,
        addr: BdAddr,
        server_channel: ServerChannel,
        conn_id: Option<ConnId>,
        context: u16,
        result: CmResult<()>,
    },
    RfcCancelAcceptCfm {
        app: AppHandle,
        server_channel: ServerChannel,
        context: u16,
        result: CmResult<()>,
    },
    RfcDisconnectCfm {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
        result: CmResult<()>,
    },
    RfcDisconnectInd {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
        reason: HciStatus,
    },
    L2capRegisterCfm {
        app: AppHandle,
        psm: Psm,
        context: u16,
        result: CmResult<()>,
    },
    L2capUnregisterCfm {
        app: AppHandle,
        psm: Psm,
        result: CmResult<()>,
    },
    L2capConnectCfm {
        app: AppHandle,
        addr: BdAddr,
        psm: Psm,
        conn_id: Option<ConnId>,
        context: u16,
        result: CmResult<()>,
    },
    L2capConnectAcceptCfm {
        app: AppHandle,
        addr: BdAddr,
        psm: Psm,
        conn_id: Option<ConnId>,
        context: u16,
        result: CmResult<()>,
    },
    L2capCancelAcceptCfm {
        app: AppHandle,
        psm: Psm,
        context: u16,
        result: CmResult<()>,
    },
    L2capDisconnectCfm {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
        result: CmResult<()>,
    },
    L2capDisconnectInd {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
        reason: HciStatus,
    },
    BnepConnectCfm {
        app: AppHandle,
        addr: BdAddr,
        result: CmResult<()>,
    },
    BnepDisconnectInd {
        app: AppHandle,
        addr: BdAddr,
        reason: HciStatus,
    },
    ScoConnectCfm {
        app: AppHandle,
        conn_id: ConnId,
        handle: Option<ScoHandle>,
        negotiated: Option<SyncNegotiatedParams>,
        result: CmResult<()>,
    },
    /// An incoming synchronous connection completed on an accepting channel.
    ScoAcceptConnectCfm {
        app: AppHandle,
        conn_id: ConnId,
        handle: Option<ScoHandle>,
        negotiated: Option<SyncNegotiatedParams>,
        result: CmResult<()>,
    },
    ScoCancelAcceptCfm {
        app: AppHandle,
        conn_id: ConnId,
        result: CmResult<()>,
    },
    ScoDisconnectCfm {
        app: AppHandle,
        conn_id: ConnId,
        handle: ScoHandle,
        result: CmResult<()>,
    },
    ScoDisconnectInd {
        app: AppHandle,
        conn_id: ConnId,
        handle: ScoHandle,
        reason: HciStatus,
    },
    InquiryResultInd {
        app: AppHandle,
        addr: BdAddr,
        class_of_device: ClassOfDevice,
    },
    InquiryCfm {
        app: AppHandle,
        result: CmResult<()>,
    },
}

impl CmEvent {
    /// The application handle this event is addressed to.
    pub fn app(&self) -> AppHandle {
        match *self {
            CmEvent::AclOpenCfm { app, .. }
            | CmEvent::AclCloseCfm { app, .. }
            | CmEvent::RemoteVersionCfm { app, .. }
            | CmEvent::LinkSupervisionTimeoutCfm { app, .. }
            | CmEvent::ModeChangeCfm { app, .. }
            | CmEvent::ModeChangeInd { app, .. }
            | CmEvent::RoleSwitchCfm { app, .. }
            | CmEvent::RfcRegisterCfm { app, .. }
            | CmEvent::RfcConnectCfm { app, .. }
            | CmEvent::RfcConnectAcceptCfm { app, .. }
            | CmEvent::RfcCancelAcceptCfm { app, .. }
            | CmEvent::RfcDisconnectCfm { app, .. }
            | CmEvent::RfcDisconnectInd { app, .. }
            | CmEvent::L2capRegisterCfm { app, .. }
            | CmEvent::L2capUnregisterCfm { app, .. }
            | CmEvent::L2capConnectCfm { app, .. }
            | CmEvent::L2capConnectAcceptCfm { app, .. }
            | CmEvent::L2capCancelAcceptCfm { app, .. }
            | CmEvent::L2capDisconnectCfm { app, .. }
            | CmEvent::L2capDisconnectInd { app, .. }
            | CmEvent::BnepConnectCfm { app, .. }
            | CmEvent::BnepDisconnectInd { app, .. }
            | CmEvent::ScoConnectCfm { app, .. }
            | CmEvent::ScoAcceptConnectCfm { app, .. }
            | CmEvent::ScoCancelAcceptCfm { app, .. }
            | CmEvent::ScoDisconnectCfm { app, .. }
            | CmEvent::ScoDisconnectInd { app, .. }
            | CmEvent::InquiryResultInd { app, .. }
            | CmEvent::InquiryCfm { app, .. } => app,
        }
    }
}
