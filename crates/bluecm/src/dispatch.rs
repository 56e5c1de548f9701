//! Request routing.
//!
//! Every application request is a variant of the closed `Request` enum;
//! the exhaustive match below replaces a numeric jump table, so an
//! out-of-range identifier can only exist at a deserialization boundary
//! outside this crate. The router classifies each request onto one of the
//! three subsystem serializers, defers it while that subsystem holds a
//! command in flight, and dispatches it otherwise. A few request kinds
//! bypass the serializers (multiplexed through the pending-request queue)
//! or run provider-style on arrival because they may need to reach into a
//! save queue.

use log::warn;

use crate::controller::{AclFlags, ControllerEvent, HciStatus};
use crate::context::CmContext;
use crate::l2cap::Psm;
use crate::sco::SyncParams;
use crate::types::{
    AppHandle, BdAddr, ClassOfDevice, ConnId, Role, ServerChannel, SniffSettings, Transport,
    TypedAddr,
};
use crate::{acl, bnep, discovery, l2cap, rfc, sco};

/// The three controller-side resources, each protected by one serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemClass {
    DeviceManager,
    ServiceManager,
    Discovery,
}

/// Application requests accepted by the Connection Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AclOpen {
        app: AppHandle,
        addr: TypedAddr,
        flags: AclFlags,
    },
    AclClose {
        app: AppHandle,
        addr: TypedAddr,
        flags: AclFlags,
        reason: HciStatus,
    },
    ReadRemoteVersion {
        app: AppHandle,
        addr: BdAddr,
        transport: Transport,
    },
    WriteLinkSupervisionTimeout {
        app: AppHandle,
        addr: BdAddr,
        timeout: u16,
    },
    SwitchRole {
        app: AppHandle,
        addr: BdAddr,
        role: Role,
    },
    SniffMode {
        app: AppHandle,
        addr: BdAddr,
        settings: SniffSettings,
    },
    ExitSniff {
        app: AppHandle,
        addr: BdAddr,
    },
    RfcRegister {
        app: AppHandle,
        server_channel: ServerChannel,
        context: u16,
    },
    RfcConnect {
        app: AppHandle,
        addr: BdAddr,
        server_channel: ServerChannel,
        context: u16,
        class_of_device: ClassOfDevice,
        max_frame_size: u16,
    },
    RfcCancelConnect {
        app: AppHandle,
        addr: BdAddr,
        server_channel: ServerChannel,
    },
    RfcConnectAccept {
        app: AppHandle,
        server_channel: ServerChannel,
        context: u16,
        accept_timeout: Option<u16>,
        class_of_device: ClassOfDevice,
    },
    RfcCancelConnectAccept {
        app: AppHandle,
        server_channel: ServerChannel,
        context: u16,
    },
    RfcDisconnect {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
    },
    /// Expiry of an accept registration's timeout; hosts own time and feed
    /// this back as a request.
    RfcAcceptTimeout {
        server_channel: ServerChannel,
        context: u16,
    },
    L2capRegister {
        app: AppHandle,
        psm: Psm,
        context: u16,
    },
    L2capUnregister {
        app: AppHandle,
        psm: Psm,
    },
    L2capConnect {
        app: AppHandle,
        addr: BdAddr,
        psm: Psm,
        remote_psm: Psm,
        context: u16,
        class_of_device: ClassOfDevice,
    },
    L2capConnectAccept {
        app: AppHandle,
        psm: Psm,
        context: u16,
        class_of_device: ClassOfDevice,
    },
    L2capCancelConnectAccept {
        app: AppHandle,
        psm: Psm,
        context: u16,
    },
    L2capDisconnect {
        app: AppHandle,
        conn_id: ConnId,
        context: u16,
    },
    BnepConnect {
        app: AppHandle,
        addr: BdAddr,
    },
    BnepDisconnect {
        app: AppHandle,
        addr: BdAddr,
    },
    ScoConnect {
        app: AppHandle,
        conn_id: ConnId,
        params: Vec<SyncParams>,
    },
    ScoAcceptConnect {
        app: AppHandle,
        conn_id: ConnId,
        params: Vec<SyncParams>,
    },
    ScoCancelAcceptConnect {
        app: AppHandle,
        conn_id: ConnId,
    },
    ScoDisconnect {
        app: AppHandle,
        conn_id: ConnId,
        reason: HciStatus,
    },
    Inquiry {
        app: AppHandle,
        access_code: u32,
        timeout: u8,
        max_responses: u8,
    },
    CancelInquiry {
        app: AppHandle,
    },
}

/// Discriminant of a request; doubles as the serializer lock token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    AclOpen,
    AclClose,
    ReadRemoteVersion,
    WriteLinkSupervisionTimeout,
    SwitchRole,
    SniffMode,
    ExitSniff,
    RfcRegister,
    RfcConnect,
    RfcCancelConnect,
    RfcConnectAccept,
    RfcCancelConnectAccept,
    RfcDisconnect,
    RfcAcceptTimeout,
    L2capRegister,
    L2capUnregister,
    L2capConnect,
    L2capConnectAccept,
    L2capCancelConnectAccept,
    L2capDisconnect,
    BnepConnect,
    BnepDisconnect,
    ScoConnect,
    ScoAcceptConnect,
    ScoCancelAcceptConnect,
    ScoDisconnect,
    Inquiry,
    CancelInquiry,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::AclOpen { .. } => RequestKind::AclOpen,
            Request::AclClose { .. } => RequestKind::AclClose,
            Request::ReadRemoteVersion { .. } => RequestKind::ReadRemoteVersion,
            Request::WriteLinkSupervisionTimeout { .. } => {
                RequestKind::WriteLinkSupervisionTimeout
            }
            Request::SwitchRole { .. } => RequestKind::SwitchRole,
            Request::SniffMode { .. } => RequestKind::SniffMode,
            Request::ExitSniff { .. } => RequestKind::ExitSniff,
            Request::RfcRegister { .. } => RequestKind::RfcRegister,
            Request::RfcConnect { .. } => RequestKind::RfcConnect,
            Request::RfcCancelConnect { .. } => RequestKind::RfcCancelConnect,
            Request::RfcConnectAccept { .. } => RequestKind::RfcConnectAccept,
            Request::RfcCancelConnectAccept { .. } => RequestKind::RfcCancelConnectAccept,
            Request::RfcDisconnect { .. } => RequestKind::RfcDisconnect,
            Request::RfcAcceptTimeout { .. } => RequestKind::RfcAcceptTimeout,
            Request::L2capRegister { .. } => RequestKind::L2capRegister,
            Request::L2capUnregister { .. } => RequestKind::L2capUnregister,
            Request::L2capConnect { .. } => RequestKind::L2capConnect,
            Request::L2capConnectAccept { .. } => RequestKind::L2capConnectAccept,
            Request::L2capCancelConnectAccept { .. } => RequestKind::L2capCancelConnectAccept,
            Request::L2capDisconnect { .. } => RequestKind::L2capDisconnect,
            Request::BnepConnect { .. } => RequestKind::BnepConnect,
            Request::BnepDisconnect { .. } => RequestKind::BnepDisconnect,
            Request::ScoConnect { .. } => RequestKind::ScoConnect,
            Request::ScoAcceptConnect { .. } => RequestKind::ScoAcceptConnect,
            Request::ScoCancelAcceptConnect { .. } => RequestKind::ScoCancelAcceptConnect,
            Request::ScoDisconnect { .. } => RequestKind::ScoDisconnect,
            Request::Inquiry { .. } => RequestKind::Inquiry,
            Request::CancelInquiry { .. } => RequestKind::CancelInquiry,
        }
    }
}

/// How a request kind reaches its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    /// Gated by the class serializer: deferred while locked, otherwise
    /// locks it for the duration of the controller exchange.
    Lock(SubsystemClass),
    /// Never locks; multiplexed through the pending-request queue.
    Bypass,
    /// Runs on arrival, before the serializer; may reach into a save
    /// queue to cancel a not-yet-dispatched request.
    Provider,
}

fn policy(kind: RequestKind) -> Policy {
    use RequestKind::*;
    match kind {
        AclOpen | ReadRemoteVersion | L2capUnregister | CancelInquiry => Policy::Bypass,
        RfcCancelConnect | RfcCancelConnectAccept | L2capCancelConnectAccept => Policy::Provider,
        AclClose | WriteLinkSupervisionTimeout | SwitchRole | ScoConnect | ScoAcceptConnect
        | ScoCancelAcceptConnect | ScoDisconnect => Policy::Lock(SubsystemClass::DeviceManager),
        SniffMode | ExitSniff | RfcRegister | RfcConnect | RfcConnectAccept | RfcDisconnect
        | RfcAcceptTimeout | L2capRegister | L2capConnect | L2capConnectAccept
        | L2capDisconnect | BnepConnect | BnepDisconnect => {
            Policy::Lock(SubsystemClass::ServiceManager)
        }
        Inquiry => Policy::Lock(SubsystemClass::Discovery),
    }
}

impl CmContext {
    fn serializer_mut(&mut self, class: SubsystemClass) -> &mut crate::serializer::Serializer {
        match class {
            SubsystemClass::DeviceManager => &mut self.dm.serializer,
            SubsystemClass::ServiceManager => &mut self.sm.serializer,
            SubsystemClass::Discovery => &mut self.discovery.serializer,
        }
    }

    /// Entry point for application requests.
    pub fn handle_request(&mut self, request: Request) {
        match policy(request.kind()) {
            Policy::Provider => self.dispatch_provider(request),
            Policy::Bypass => self.dispatch_bypass(request),
            Policy::Lock(class) => self.route_locked(class, request),
        }
    }

    /// Routes a request through the service-manager serializer. Used by the
    /// provider-level cancel handlers when the target turned out to be live.
    pub(crate) fn route_service_request(&mut self, request: Request) {
        self.route_locked(SubsystemClass::ServiceManager, request);
    }

    fn route_locked(&mut self, class: SubsystemClass, request: Request) {
        let kind = request.kind();
        let serializer = self.serializer_mut(class);
        if serializer.is_locked() {
            serializer.defer(request);
            return;
        }
        serializer.lock(kind);
        self.dispatch_locked(request);
    }

    /// Unlocks the class serializer and, within the same synchronous step,
    /// either dispatches the next saved request or resolves the standing
    /// restart condition. Never leaves the unlock dangling.
    pub(crate) fn complete_and_restore(&mut self, class: SubsystemClass) {
        self.serializer_mut(class).unlock();

        if class == SubsystemClass::ServiceManager {
            // House cleaning: elements whose instance is gone are dropped
            // here, and only here, so ids stay stable while referenced.
            self.purge_unused_elements();
        }

        if let Some(next) = self.serializer_mut(class).take_deferred() {
            let kind = next.kind();
            self.serializer_mut(class).lock(kind);
            self.dispatch_locked(next);
        } else {
            discovery::resolve_restart(self);
        }
    }

    fn dispatch_provider(&mut self, request: Request) {
        match request {
            Request::RfcCancelConnect {
                app,
                addr,
                server_channel,
            } => rfc::cancel_connect_req(self, app, addr, server_channel),
            Request::RfcCancelConnectAccept {
                app,
                server_channel,
                context,
            } => rfc::cancel_accept_provider(self, app, server_channel, context),
            Request::L2capCancelConnectAccept { app, psm, context } => {
                l2cap::cancel_accept_provider(self, app, psm, context)
            }
            other => self.general_exception("dispatch", &format!("{:?} is not a provider request", other.kind())),
        }
    }

    fn dispatch_bypass(&mut self, request: Request) {
        match request {
            Request::AclOpen { app, addr, flags } => acl::acl_open_req(self, app, addr, flags),
            Request::ReadRemoteVersion {
                app,
                addr,
                transport,
            } => acl::remote_version_req(self, app, addr, transport),
            Request::L2capUnregister { app, psm } => l2cap::unregister_req(self, app, psm),
            Request::CancelInquiry { app } => discovery::cancel_inquiry_req(self, app),
            other => self.general_exception("dispatch", &format!("{:?} is not a bypass request", other.kind())),
        }
    }

    /// Dispatches a request whose class serializer has just been locked
    /// with its kind. Handlers either complete synchronously (restoring
    /// the queue themselves) or leave the lock held for the confirmation.
    fn dispatch_locked(&mut self, request: Request) {
        match request {
            Request::AclClose {
                app,
                addr,
                flags,
                reason,
            } => acl::acl_close_req(self, app, addr, flags, reason),
            Request::WriteLinkSupervisionTimeout { app, addr, timeout } => {
                acl::lsto_req(self, app, addr, timeout)
            }
            Request::SwitchRole { app, addr, role } => acl::switch_role_req(self, app, addr, role),
            Request::SniffMode {
                app,
                addr,
                settings,
            } => acl::sniff_mode_req(self, app, addr, settings),
            Request::ExitSniff { app, addr } => acl::exit_sniff_req(self, app, addr),
            Request::RfcRegister {
                app,
                server_channel,
                context,
            } => rfc::register_req(self, app, server_channel, context),
            Request::RfcConnect {
                app,
                addr,
                server_channel,
                context,
                class_of_device,
                max_frame_size,
            } => rfc::connect_req(
                self,
                app,
                addr,
                server_channel,
                context,
                class_of_device,
                max_frame_size,
            ),
            Request::RfcConnectAccept {
                app,
                server_channel,
                context,
                accept_timeout,
                class_of_device,
            } => rfc::connect_accept_req(
                self,
                app,
                server_channel,
                context,
                accept_timeout,
                class_of_device,
            ),
            Request::RfcCancelConnectAccept {
                app,
                server_channel,
                context,
            } => rfc::cancel_accept_req(self, app, server_channel, context),
            Request::RfcDisconnect {
                app,
                conn_id,
                context,
            } => rfc::release_req(self, app, conn_id, context),
            Request::RfcAcceptTimeout {
                server_channel,
                context,
            } => rfc::accept_timeout(self, server_channel, context),
            Request::L2capRegister { app, psm, context } => {
                l2cap::register_req(self, app, psm, context)
            }
            Request::L2capConnect {
                app,
                addr,
                psm,
                remote_psm,
                context,
                class_of_device,
            } => l2cap::connect_req(self, app, addr, psm, remote_psm, context, class_of_device),
            Request::L2capConnectAccept {
                app,
                psm,
                context,
                class_of_device,
            } => l2cap::connect_accept_req(self, app, psm, context, class_of_device),
            Request::L2capCancelConnectAccept { app, psm, context } => {
                l2cap::cancel_accept_req(self, app, psm, context)
            }
            Request::L2capDisconnect {
                app,
                conn_id,
                context,
            } => l2cap::disconnect_req(self, app, conn_id, context),
            Request::BnepConnect { app, addr } => bnep::connect_req(self, app, addr),
            Request::BnepDisconnect { app, addr } => bnep::disconnect_req(self, app, addr),
            Request::ScoConnect {
                app,
                conn_id,
                params,
            } => sco::connect_req(self, app, conn_id, params),
            Request::ScoAcceptConnect {
                app,
                conn_id,
                params,
            } => sco::accept_connect_req(self, app, conn_id, params),
            Request::ScoCancelAcceptConnect { app, conn_id } => {
                sco::cancel_accept_req(self, app, conn_id)
            }
            Request::ScoDisconnect {
                app,
                conn_id,
                reason,
            } => sco::disconnect_req(self, app, conn_id, reason),
            Request::Inquiry {
                app,
                access_code,
                timeout,
                max_responses,
            } => discovery::inquiry_req(self, app, access_code, timeout, max_responses),
            other => {
                // A bypass/provider request can only land here through a
                // router bug; report and drop, never crash.
                warn!("request {:?} reached the locked dispatcher", other.kind());
                self.general_exception("dispatch", "misrouted request");
            }
        }
    }

    /// Entry point for controller confirmations and indications.
    pub fn handle_controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::AclOpenedInd {
                addr,
                incoming,
                class_of_device,
                status,
            } => acl::acl_opened_ind(self, addr, incoming, class_of_device, status),
            ControllerEvent::AclOpenCfm { addr, success } => {
                acl::acl_open_cfm(self, addr, success)
            }
            ControllerEvent::AclClosedInd { addr, reason } => {
                acl::acl_closed_ind(self, addr, reason)
            }
            ControllerEvent::AclCloseCfm {
                addr,
                flags,
                status,
            } => acl::acl_close_cfm(self, addr, flags, status),
            ControllerEvent::RemoteFeaturesCfm {
                addr,
                status,
                features,
            } => acl::remote_features_cfm(self, addr, status, features),
            ControllerEvent::RemoteVersionCfm {
                addr,
                status,
                lmp_version,
                manufacturer,
                lmp_subversion,
            } => acl::remote_version_cfm(
                self,
                addr,
                status,
                lmp_version,
                manufacturer,
                lmp_subversion,
            ),
            ControllerEvent::RoleDiscoveryCfm { addr, status, role } => {
                acl::role_discovery_cfm(self, addr, status, role)
            }
            ControllerEvent::RoleChangeInd { addr, status, role } => {
                acl::role_change_ind(self, addr, status, role)
            }
            ControllerEvent::SwitchRoleCfm { addr, status, role } => {
                acl::switch_role_cfm(self, addr, status, role)
            }
            ControllerEvent::ModeChangeInd {
                addr,
                status,
                mode,
                interval,
            } => acl::mode_change_ind(self, addr, status, mode, interval),
            ControllerEvent::EncryptionChangeInd { addr, encryption } => {
                acl::encryption_change_ind(self, addr, encryption)
            }
            ControllerEvent::WriteLinkSupervisionTimeoutCfm { addr, status } => {
                acl::lsto_cfm(self, addr, status)
            }
            ControllerEvent::LinkSupervisionTimeoutChangeInd { addr, timeout } => {
                acl::lsto_change_ind(self, addr, timeout)
            }
            ControllerEvent::RfcRegisterCfm {
                server_channel,
                success,
            } => rfc::register_cfm(self, server_channel, success),
            ControllerEvent::RfcConnectCfm {
                addr,
                server_channel,
                conn_id,
                status,
            } => rfc::connect_cfm(self, addr, server_channel, conn_id, status),
            ControllerEvent::RfcConnectInd {
                addr,
                server_channel,
                conn_id,
            } => rfc::connect_ind(self, addr, server_channel, conn_id),
            ControllerEvent::RfcConnectCompleteInd { conn_id, status } => {
                rfc::connect_complete_ind(self, conn_id, status)
            }
            ControllerEvent::RfcReleaseCfm { conn_id, status } => {
                rfc::release_cfm(self, conn_id, status)
            }
            ControllerEvent::RfcReleaseInd { conn_id, reason } => {
                rfc::release_ind(self, conn_id, reason)
            }
            ControllerEvent::L2capRegisterCfm { psm, success } => {
                l2cap::register_cfm(self, psm, success)
            }
            ControllerEvent::L2capUnregisterCfm { psm, status } => {
                l2cap::unregister_cfm(self, psm, status)
            }
            ControllerEvent::L2capConnectCfm {
                addr,
                psm,
                conn_id,
                status,
            } => l2cap::connect_cfm(self, addr, psm, conn_id, status),
            ControllerEvent::L2capConnectInd { addr, psm, conn_id } => {
                l2cap::connect_ind(self, addr, psm, conn_id)
            }
            ControllerEvent::L2capConnectCompleteInd { conn_id, status } => {
                l2cap::connect_complete_ind(self, conn_id, status)
            }
            ControllerEvent::L2capGetInfoCfm {
                addr,
                status,
                extended_features,
            } => l2cap::get_info_cfm(self, addr, status, extended_features),
            ControllerEvent::L2capDisconnectCfm { conn_id, status } => {
                l2cap::disconnect_cfm(self, conn_id, status)
            }
            ControllerEvent::L2capDisconnectInd { conn_id, reason } => {
                l2cap::disconnect_ind(self, conn_id, reason)
            }
            ControllerEvent::BnepConnectCfm { addr, status } => {
                bnep::connect_cfm(self, addr, status)
            }
            ControllerEvent::BnepDisconnectInd { addr, reason } => {
                bnep::disconnect_ind(self, addr, reason)
            }
            ControllerEvent::SyncConnectCfm {
                addr,
                handle,
                status,
                negotiated,
            } => sco::sync_connect_cfm(self, addr, handle, status, negotiated),
            ControllerEvent::SyncConnectInd { addr, link_type } => {
                sco::sync_connect_ind(self, addr, link_type)
            }
            ControllerEvent::SyncConnectCompleteInd {
                addr,
                handle,
                status,
                negotiated,
            } => sco::sync_connect_complete_ind(self, addr, handle, status, negotiated),
            ControllerEvent::SyncDisconnectCfm { handle, status } => {
                sco::sync_disconnect_cfm(self, handle, status)
            }
            ControllerEvent::SyncDisconnectInd { handle, reason } => {
                sco::sync_disconnect_ind(self, handle, reason)
            }
            ControllerEvent::InquiryResultInd {
                addr,
                class_of_device,
            } => discovery::inquiry_result_ind(self, addr, class_of_device),
            ControllerEvent::InquiryCompleteInd { status } => {
                discovery::inquiry_complete_ind(self, status)
            }
            ControllerEvent::InquiryCancelCfm { status } => {
                discovery::inquiry_cancel_cfm(self, status)
            }
        }
    }
}
