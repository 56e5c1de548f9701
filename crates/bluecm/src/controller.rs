//! Device-controller command/confirmation interface.
//!
//! One request type per controller operation and one matching
//! confirmation/indication type. Commands are owned values pushed onto the
//! context's single outgoing command queue; the host drains that queue into
//! whatever transport it uses. Events arrive asynchronously and, for
//! controller-initiated activity, unsolicited.

use bitflags::bitflags;

use crate::l2cap::Psm;
use crate::sco::{SyncNegotiatedParams, SyncParams};
use crate::types::{
    BdAddr, ClassOfDevice, ConnId, LinkMode, Role, ScoHandle, ServerChannel, SniffSettings,
    Transport, TypedAddr,
};

/// Controller status/reason code, passed through verbatim where a
/// confirmation carries one.
pub type HciStatus = u8;

pub const HCI_SUCCESS: HciStatus = 0x00;
pub const HCI_ERROR_PAGE_TIMEOUT: HciStatus = 0x04;
pub const HCI_ERROR_CONNECTION_TIMEOUT: HciStatus = 0x08;
pub const HCI_ERROR_OETC_USER: HciStatus = 0x13;
pub const HCI_ERROR_CONN_TERM_LOCAL_HOST: HciStatus = 0x16;
pub const HCI_ERROR_UNSUPPORTED_REMOTE_FEATURE: HciStatus = 0x1A;
pub const HCI_ERROR_UNACCEPTABLE_PARAMETERS: HciStatus = 0x1E;
pub const HCI_ERROR_REJECTED_DUE_TO_LIMITED_RESOURCES: HciStatus = 0x0D;

bitflags! {
    /// Flags qualifying an ACL open or close request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AclFlags: u16 {
        /// The link was initiated by the remote device.
        const INCOMING = 0x0001;
        /// Close regardless of remaining stakeholders; the requester waits
        /// for the real close confirmation.
        const FORCE = 0x0002;
        /// Close every link (address must be zero).
        const ALL = 0x0004;
        /// The request concerns the LE transport.
        const LE = 0x0008;
    }
}

impl AclFlags {
    pub fn transport(&self) -> Transport {
        if self.contains(AclFlags::LE) {
            Transport::Le
        } else {
            Transport::BrEdr
        }
    }
}

/// Synchronous link type reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLinkType {
    Sco,
    Esco,
}

/// Commands issued to the device controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    AclOpen {
        addr: TypedAddr,
        flags: AclFlags,
    },
    AclClose {
        addr: TypedAddr,
        flags: AclFlags,
        reason: HciStatus,
    },
    ReadRemoteFeatures {
        addr: BdAddr,
    },
    ReadRemoteVersion {
        addr: BdAddr,
        transport: Transport,
    },
    RoleDiscovery {
        addr: BdAddr,
    },
    SwitchRole {
        addr: BdAddr,
        role: Role,
    },
    SniffMode {
        addr: BdAddr,
        settings: SniffSettings,
    },
    ExitSniffMode {
        addr: BdAddr,
    },
    WriteLinkSupervisionTimeout {
        addr: BdAddr,
        timeout: u16,
    },
    RfcRegister {
        server_channel: ServerChannel,
    },
    RfcConnect {
        addr: BdAddr,
        server_channel: ServerChannel,
        max_frame_size: u16,
    },
    RfcConnectResponse {
        addr: BdAddr,
        server_channel: ServerChannel,
        accept: bool,
    },
    RfcRelease {
        conn_id: ConnId,
    },
    L2capRegister {
        psm: Psm,
    },
    L2capUnregister {
        psm: Psm,
    },
    L2capConnect {
        addr: BdAddr,
        psm: Psm,
    },
    L2capConnectResponse {
        addr: BdAddr,
        psm: Psm,
        accept: bool,
    },
    L2capGetInfo {
        addr: BdAddr,
    },
    L2capDisconnect {
        conn_id: ConnId,
    },
    BnepConnect {
        addr: BdAddr,
    },
    BnepDisconnect {
        addr: BdAddr,
    },
    SyncConnect {
        addr: BdAddr,
        params: SyncParams,
    },
    SyncConnectResponse {
        addr: BdAddr,
        /// `None` rejects the incoming synchronous connection.
        params: Option<SyncParams>,
        reason: HciStatus,
    },
    SyncDisconnect {
        handle: ScoHandle,
        reason: HciStatus,
    },
    Inquiry {
        access_code: u32,
        timeout: u8,
        max_responses: u8,
    },
    InquiryCancel,
}

/// Confirmations and indications delivered by the device controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A physical link came up (or an attempt finished with an error).
    AclOpenedInd {
        addr: TypedAddr,
        incoming: bool,
        class_of_device: ClassOfDevice,
        status: HciStatus,
    },
    /// Completion of a locally requested ACL open. Never delivered when a
    /// close was issued before this confirmation (protocol assumption, see
    /// the ACL engine).
    AclOpenCfm {
        addr: TypedAddr,
        success: bool,
    },
    AclClosedInd {
        addr: TypedAddr,
        reason: HciStatus,
    },
    AclCloseCfm {
        addr: TypedAddr,
        flags: AclFlags,
        status: HciStatus,
    },
    RemoteFeaturesCfm {
        addr: BdAddr,
        status: HciStatus,
        features: [u8; 8],
    },
    RemoteVersionCfm {
        addr: BdAddr,
        status: HciStatus,
        lmp_version: u8,
        manufacturer: u16,
        lmp_subversion: u16,
    },
    RoleDiscoveryCfm {
        addr: BdAddr,
        status: HciStatus,
        role: Role,
    },
    RoleChangeInd {
        addr: BdAddr,
        status: HciStatus,
        role: Role,
    },
    SwitchRoleCfm {
        addr: BdAddr,
        status: HciStatus,
        role: Role,
    },
    ModeChangeInd {
        addr: BdAddr,
        status: HciStatus,
        mode: LinkMode,
        interval: u16,
    },
    EncryptionChangeInd {
        addr: BdAddr,
        encryption: crate::types::EncryptionType,
    },
    WriteLinkSupervisionTimeoutCfm {
        addr: BdAddr,
        status: HciStatus,
    },
    LinkSupervisionTimeoutChangeInd {
        addr: BdAddr,
        timeout: u16,
    },
    RfcRegisterCfm {
        server_channel: ServerChannel,
        success: bool,
    },
    RfcConnectCfm {
        addr: BdAddr,
        server_channel: ServerChannel,
        conn_id: ConnId,
        status: HciStatus,
    },
    RfcConnectInd {
        addr: BdAddr,
        server_channel: ServerChannel,
        conn_id: ConnId,
    },
    RfcConnectCompleteInd {
        conn_id: ConnId,
        status: HciStatus,
    },
    RfcReleaseCfm {
        conn_id: ConnId,
        status: HciStatus,
    },
    RfcReleaseInd {
        conn_id: ConnId,
        reason: HciStatus,
    },
    L2capRegisterCfm {
        psm: Psm,
        success: bool,
    },
    L2capUnregisterCfm {
        psm: Psm,
        status: HciStatus,
    },
    L2capConnectCfm {
        addr: BdAddr,
        psm: Psm,
        conn_id: ConnId,
        status: HciStatus,
    },
    L2capConnectInd {
        addr: BdAddr,
        psm: Psm,
        conn_id: ConnId,
    },
    L2capConnectCompleteInd {
        conn_id: ConnId,
        status: HciStatus,
    },
    L2capGetInfoCfm {
        addr: BdAddr,
        status: HciStatus,
        extended_features: u32,
    },
    L2capDisconnectCfm {
        conn_id: ConnId,
        status: HciStatus,
    },
    L2capDisconnectInd {
        conn_id: ConnId,
        reason: HciStatus,
    },
    BnepConnectCfm {
        addr: BdAddr,
        status: HciStatus,
    },
    BnepDisconnectInd {
        addr: BdAddr,
        reason: HciStatus,
    },
    SyncConnectCfm {
        addr: BdAddr,
        handle: ScoHandle,
        status: HciStatus,
        negotiated: Option<SyncNegotiatedParams>,
    },
    SyncConnectInd {
        addr: BdAddr,
        link_type: SyncLinkType,
    },
    SyncConnectCompleteInd {
        addr: BdAddr,
        handle: ScoHandle,
        status: HciStatus,
        negotiated: Option<SyncNegotiatedParams>,
    },
    SyncDisconnectCfm {
        handle: ScoHandle,
        status: HciStatus,
    },
    SyncDisconnectInd {
        handle: ScoHandle,
        reason: HciStatus,
    },
    InquiryResultInd {
        addr: BdAddr,
        class_of_device: ClassOfDevice,
    },
    InquiryCompleteInd {
        status: HciStatus,
    },
    InquiryCancelCfm {
        status: HciStatus,
    },
}
