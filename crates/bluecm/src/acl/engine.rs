//! ACL lifecycle engine.
//!
//! Drives physical links through `Null -> ConnectInit -> Connect -> Null`
//! in response to requests and controller confirmations. The engine owns
//! the early-close protocol assumption: once a close request has been
//! issued before the open confirmation arrived, the controller never
//! delivers that open confirmation, so the pending open parameters must be
//! cancelled locally.

use log::{info, warn};

use crate::controller::{
    AclFlags, ControllerCommand, HciStatus, HCI_ERROR_OETC_USER, HCI_ERROR_PAGE_TIMEOUT,
    HCI_SUCCESS,
};
use crate::context::{CmContext, DmState};
use crate::devutil::DeviceUtilityEvent;
use crate::dispatch::{Request, RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::pending::{PendingKind, PendingRequest};
use crate::types::{
    AppHandle, BdAddr, ClassOfDevice, EncryptionType, LinkMode, Role, SniffSettings, Transport,
    TypedAddr,
};
use crate::{l2cap, rfc};

/// Sums every live contribution keeping the ACL to `addr` alive: record
/// stakeholders (application request, GATT), connected RFCOMM channels,
/// connected L2CAP channels and connected BNEP channels.
pub(crate) fn count_connections_to_peer(cm: &CmContext, addr: &BdAddr) -> u8 {
    let mut count = 0;
    if let Some(record) = cm.acl.find(addr) {
        count += record.stakeholders();
    }
    count += rfc::count_connected_to(cm, addr);
    count += l2cap::count_connected_to(cm, addr);
    count += cm.bnep.count_connected_to(addr);
    count
}

fn find_pending_open(
    cm: &CmContext,
    app: AppHandle,
    addr: &TypedAddr,
    transport: Transport,
) -> bool {
    cm.pending
        .find(|e| {
            matches!(e, PendingRequest::AclOpen { app: a, addr: ad, flags }
                if *a == app && ad.addr == addr.addr && flags.transport() == transport)
        })
        .is_some()
}

pub(crate) fn acl_open_req(cm: &mut CmContext, app: AppHandle, addr: TypedAddr, flags: AclFlags) {
    // An existing ACL with at least one stakeholder only gains a
    // stakeholder; no controller interaction.
    if count_connections_to_peer(cm, &addr.addr) > 0 && cm.acl.find(&addr.addr).is_some() {
        if app != AppHandle::CM {
            if let Some(record) = cm.acl.find_mut(&addr.addr) {
                record.requested_by_app = true;
            }
            cm.send_event(CmEvent::AclOpenCfm {
                app,
                addr,
                result: Ok(()),
            });
        }
        return;
    }

    // Guard against the same requester flooding the pending queue with
    // back-to-back opens for one address and transport.
    if find_pending_open(cm, app, &addr, flags.transport()) {
        warn!(
            "ACL open already pending for {} transport {:?} app {}",
            addr.addr,
            flags.transport(),
            app
        );
        if app != AppHandle::CM {
            cm.send_event(CmEvent::AclOpenCfm {
                app,
                addr,
                result: Err(CmError::AlreadyConnecting),
            });
        }
        return;
    }

    // Park the open parameters; the entry resolves the later confirmation,
    // or is cancelled by an early close.
    cm.pending.push(PendingRequest::AclOpen { app, addr, flags });

    if cm.dm.state == DmState::Null && !flags.contains(AclFlags::INCOMING) {
        cm.set_dm_state(DmState::ConnectInit);
    }
    cm.send_command(ControllerCommand::AclOpen { addr, flags });
}

pub(crate) fn acl_open_cfm(cm: &mut CmContext, addr: TypedAddr, success: bool) {
    let entry = cm.pending.remove_matching(|e| {
        matches!(e, PendingRequest::AclOpen { addr: ad, .. } if ad.addr == addr.addr)
    });

    let Some(PendingRequest::AclOpen { app, .. }) = entry else {
        // No parked parameters: an early close already cancelled this open,
        // or the confirmation is stale.
        return;
    };

    if app != AppHandle::CM {
        if success {
            if let Some(record) = cm.acl.find_mut(&addr.addr) {
                record.requested_by_app = true;
            }
        }
        let result = if success {
            Ok(())
        } else {
            Err(CmError::ControllerFailure(HCI_ERROR_PAGE_TIMEOUT))
        };
        cm.send_event(CmEvent::AclOpenCfm { app, addr, result });
    }
}

/// Clears parked open parameters that a close request supersedes. The
/// controller will not confirm an open once the close has been issued, so
/// leaving an entry behind would strand it forever.
fn remove_pending_opens_for_close(cm: &mut CmContext, app: AppHandle, addr: &TypedAddr, flags: AclFlags) {
    if flags.contains(AclFlags::ALL) && addr.addr.is_zero() {
        cm.pending
            .remove_all(|e| matches!(e, PendingRequest::AclOpen { .. }));
    } else if flags.contains(AclFlags::FORCE) {
        let transport = flags.transport();
        cm.pending.remove_all(|e| {
            matches!(e, PendingRequest::AclOpen { addr: ad, flags: f, .. }
                if ad.addr == addr.addr && f.transport() == transport)
        });
    } else {
        let transport = flags.transport();
        cm.pending.remove_matching(|e| {
            matches!(e, PendingRequest::AclOpen { app: a, addr: ad, flags: f }
                if *a == app && ad.addr == addr.addr && f.transport() == transport)
        });
    }
}

pub(crate) fn acl_close_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: TypedAddr,
    flags: AclFlags,
    reason: HciStatus,
) {
    cm.dm.app_handle = app;

    remove_pending_opens_for_close(cm, app, &addr, flags);

    if !flags.contains(AclFlags::FORCE) {
        // Releasing a stakeholder, not tearing the link down.
        if let Some(record) = cm.acl.find_mut(&addr.addr) {
            record.requested_by_app = false;
        }
    }

    cm.send_command(ControllerCommand::AclClose { addr, flags, reason });

    // A non-forced close never produces a confirmation the requester waits
    // for; unblock the queue at once.
    if !flags.contains(AclFlags::FORCE) {
        cm.complete_and_restore(SubsystemClass::DeviceManager);
    }
}

pub(crate) fn acl_close_cfm(cm: &mut CmContext, addr: TypedAddr, flags: AclFlags, status: HciStatus) {
    // Only a forced disconnection is confirmed to the requester.
    if !flags.contains(AclFlags::FORCE) {
        return;
    }

    if cm.dm.app_handle != AppHandle::CM {
        if let Some(record) = cm.acl.find_mut(&addr.addr) {
            record.requested_by_app = false;
        }

        if cm.dm.serializer.lock_token() == Some(RequestKind::AclClose)
            && cm.dm.app_handle != AppHandle::INVALID
        {
            let app = cm.dm.app_handle;
            cm.send_event(CmEvent::AclCloseCfm {
                app,
                addr,
                reason: status,
            });
        }
    }

    cm.set_dm_state(DmState::Null);

    if cm.dm.serializer.lock_token() == Some(RequestKind::AclClose) {
        cm.dm.app_handle = AppHandle::INVALID;
        cm.complete_and_restore(SubsystemClass::DeviceManager);
    }
}

pub(crate) fn acl_opened_ind(
    cm: &mut CmContext,
    addr: TypedAddr,
    incoming: bool,
    class_of_device: ClassOfDevice,
    status: HciStatus,
) {
    if status != HCI_SUCCESS {
        if cm.dm.state == DmState::ConnectInit {
            cm.set_dm_state(DmState::Null);
        }
        return;
    }

    if cm.acl.find(&addr.addr).is_some() {
        cm.general_exception("acl", "opened indication for an occupied slot");
        return;
    }

    match cm.acl.allocate() {
        Some(slot) => {
            slot.init_for(addr.addr, incoming, class_of_device);
            slot.address_type = addr.kind;
            info!("ACL up: {} ({})", addr.addr, if incoming { "incoming" } else { "outgoing" });

            if cm.dm.state == DmState::ConnectInit {
                cm.set_dm_state(DmState::Connect);
            }

            cm.notify_device_utility(DeviceUtilityEvent::AclOpened {
                addr: addr.addr,
                incoming,
            });

            // Standard post-open read sequence. These are fire-and-forget
            // reads multiplexed by the controller; none of them locks the
            // device-manager queue.
            cm.send_command(ControllerCommand::ReadRemoteFeatures { addr: addr.addr });
            remote_version_req(cm, AppHandle::CM, addr.addr, Transport::BrEdr);
            cm.send_command(ControllerCommand::RoleDiscovery { addr: addr.addr });
        }
        None => {
            // Table exhausted: the link cannot be tracked, take it down.
            warn!("ACL table full, closing {}", addr.addr);
            cm.handle_request(Request::AclClose {
                app: AppHandle::CM,
                addr,
                flags: AclFlags::FORCE,
                reason: HCI_ERROR_OETC_USER,
            });
        }
    }
}

pub(crate) fn acl_closed_ind(cm: &mut CmContext, addr: TypedAddr, reason: HciStatus) {
    info!("ACL down: {} (reason 0x{:02X})", addr.addr, reason);

    cm.acl.clear(&addr.addr);
    cm.notify_device_utility(DeviceUtilityEvent::AclClosed {
        addr: addr.addr,
        reason,
    });

    // Profile connections still waiting for their own indication never get
    // one now; complete them with the close reason.
    rfc::acl_closed(cm, &addr.addr, reason);
    l2cap::acl_closed(cm, &addr.addr, reason);
}

pub(crate) fn remote_version_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: BdAddr,
    transport: Transport,
) {
    // Strictly one read on the wire; later requests wait their turn in the
    // pending queue and are kicked by the confirmation handler.
    let busy = cm.pending.find_first(PendingKind::RemoteVersion).is_some();
    cm.pending.push(PendingRequest::RemoteVersion {
        app,
        addr,
        transport,
    });
    if !busy {
        cm.send_command(ControllerCommand::ReadRemoteVersion { addr, transport });
    }
}

pub(crate) fn remote_version_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    status: HciStatus,
    lmp_version: u8,
    manufacturer: u16,
    lmp_subversion: u16,
) {
    match cm.pending.remove_first(PendingKind::RemoteVersion) {
        Some(PendingRequest::RemoteVersion {
            app, addr: wanted, ..
        }) => {
            if wanted != addr {
                cm.general_exception("acl", "remote version confirmation out of order");
            }

            if status == HCI_SUCCESS {
                if let Some(record) = cm.acl.find_mut(&addr) {
                    record.lmp_version = lmp_version;
                    record.manufacturer = manufacturer;
                    record.lmp_subversion = lmp_subversion;
                }
            }

            if app != AppHandle::CM {
                let result = if status == HCI_SUCCESS {
                    Ok(())
                } else {
                    Err(CmError::ControllerFailure(status))
                };
                cm.send_event(CmEvent::RemoteVersionCfm {
                    app,
                    addr,
                    lmp_version,
                    manufacturer,
                    lmp_subversion,
                    result,
                });
            }
        }
        _ => cm.general_exception("acl", "unsolicited remote version confirmation"),
    }

    // Kick the next queued read.
    if let Some(PendingRequest::RemoteVersion { addr, transport, .. }) =
        cm.pending.find_first(PendingKind::RemoteVersion).cloned()
    {
        cm.send_command(ControllerCommand::ReadRemoteVersion { addr, transport });
    }
}

pub(crate) fn remote_features_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    status: HciStatus,
    features: [u8; 8],
) {
    if status != HCI_SUCCESS {
        return;
    }
    if let Some(record) = cm.acl.find_mut(&addr) {
        record.remote_features = features;
        record.remote_features_valid = true;
    }
}

pub(crate) fn role_discovery_cfm(cm: &mut CmContext, addr: BdAddr, status: HciStatus, role: Role) {
    if let Some(record) = cm.acl.find_mut(&addr) {
        if status == HCI_SUCCESS {
            record.role = role;
        }
        record.role_checked = true;
    }
}

pub(crate) fn switch_role_req(cm: &mut CmContext, app: AppHandle, addr: BdAddr, role: Role) {
    cm.dm.app_handle = app;
    if cm.acl.find(&addr).is_none() {
        cm.send_event(CmEvent::RoleSwitchCfm {
            app,
            addr,
            role,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }
    cm.send_command(ControllerCommand::SwitchRole { addr, role });
}

pub(crate) fn switch_role_cfm(cm: &mut CmContext, addr: BdAddr, status: HciStatus, role: Role) {
    if cm.dm.serializer.lock_token() != Some(RequestKind::SwitchRole) {
        cm.general_exception("acl", "unexpected switch role confirmation");
        return;
    }

    if status == HCI_SUCCESS {
        if let Some(record) = cm.acl.find_mut(&addr) {
            record.role = role;
        }
    }

    let app = cm.dm.app_handle;
    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    if app != AppHandle::CM && app != AppHandle::INVALID {
        cm.send_event(CmEvent::RoleSwitchCfm {
            app,
            addr,
            role,
            result,
        });
    }
    cm.complete_and_restore(SubsystemClass::DeviceManager);
}

pub(crate) fn role_change_ind(cm: &mut CmContext, addr: BdAddr, status: HciStatus, role: Role) {
    if status != HCI_SUCCESS {
        return;
    }
    if let Some(record) = cm.acl.find_mut(&addr) {
        record.role = role;
    }
    cm.notify_device_utility(DeviceUtilityEvent::RoleChange { addr, role });
}

pub(crate) fn sniff_mode_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: BdAddr,
    settings: SniffSettings,
) {
    cm.sm.app_handle = app;
    cm.sm.operating_addr = addr;

    match cm.acl.find(&addr) {
        None => {
            cm.send_event(CmEvent::ModeChangeCfm {
                app,
                addr,
                mode: LinkMode::Sniff,
                result: Err(CmError::UnknownConnection),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
        }
        Some(record) if record.mode == LinkMode::Sniff => {
            // Already where the requester wants to be.
            cm.send_event(CmEvent::ModeChangeCfm {
                app,
                addr,
                mode: LinkMode::Sniff,
                result: Ok(()),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
        }
        Some(_) => {
            cm.send_command(ControllerCommand::SniffMode { addr, settings });
        }
    }
}

pub(crate) fn exit_sniff_req(cm: &mut CmContext, app: AppHandle, addr: BdAddr) {
    cm.sm.app_handle = app;
    cm.sm.operating_addr = addr;

    match cm.acl.find(&addr) {
        None => {
            cm.send_event(CmEvent::ModeChangeCfm {
                app,
                addr,
                mode: LinkMode::Active,
                result: Err(CmError::UnknownConnection),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
        }
        Some(record) if record.mode == LinkMode::Active => {
            cm.send_event(CmEvent::ModeChangeCfm {
                app,
                addr,
                mode: LinkMode::Active,
                result: Ok(()),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
        }
        Some(_) => {
            cm.send_command(ControllerCommand::ExitSniffMode { addr });
        }
    }
}

pub(crate) fn mode_change_ind(
    cm: &mut CmContext,
    addr: BdAddr,
    status: HciStatus,
    mode: LinkMode,
    interval: u16,
) {
    if status == HCI_SUCCESS {
        if let Some(record) = cm.acl.find_mut(&addr) {
            record.mode = mode;
            record.sniff_interval = if mode == LinkMode::Sniff { interval } else { 0 };
        }
    }

    let vetoed = cm.notify_device_utility(DeviceUtilityEvent::ModeChange { addr, mode });

    let sm_token = cm.sm.serializer.lock_token();
    let requested = matches!(
        sm_token,
        Some(RequestKind::SniffMode) | Some(RequestKind::ExitSniff)
    ) && cm.sm.operating_addr == addr;

    if requested {
        let app = cm.sm.app_handle;
        let result = if status == HCI_SUCCESS {
            Ok(())
        } else {
            Err(CmError::ControllerFailure(status))
        };
        cm.send_event(CmEvent::ModeChangeCfm {
            app,
            addr,
            mode,
            result,
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
    } else if !vetoed && status == HCI_SUCCESS {
        // Unsolicited mode change: inform every application with a live
        // channel on the link.
        for app in cm.apps_with_connections_to(&addr) {
            cm.send_event(CmEvent::ModeChangeInd {
                app,
                addr,
                mode,
                interval,
            });
        }
    }
}

pub(crate) fn encryption_change_ind(cm: &mut CmContext, addr: BdAddr, encryption: EncryptionType) {
    if let Some(record) = cm.acl.find_mut(&addr) {
        record.encryption = encryption;
    }
}

pub(crate) fn lsto_req(cm: &mut CmContext, app: AppHandle, addr: BdAddr, timeout: u16) {
    if cm.acl.find(&addr).is_none() {
        cm.send_event(CmEvent::LinkSupervisionTimeoutCfm {
            app,
            addr,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    // At most one live write per address; a duplicate is rejected rather
    // than queued.
    if cm
        .pending
        .find(|e| matches!(e, PendingRequest::SupervisionTimeout { addr: a, .. } if *a == addr))
        .is_some()
    {
        cm.send_event(CmEvent::LinkSupervisionTimeoutCfm {
            app,
            addr,
            result: Err(CmError::AlreadyConnecting),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    cm.pending.push(PendingRequest::SupervisionTimeout { app, addr, timeout });
    cm.send_command(ControllerCommand::WriteLinkSupervisionTimeout { addr, timeout });
}

pub(crate) fn lsto_cfm(cm: &mut CmContext, addr: BdAddr, status: HciStatus) {
    let entry = cm.pending.remove_matching(|e| {
        matches!(e, PendingRequest::SupervisionTimeout { addr: a, .. } if *a == addr)
    });

    let Some(PendingRequest::SupervisionTimeout { app, timeout, .. }) = entry else {
        cm.general_exception("acl", "unsolicited supervision timeout confirmation");
        return;
    };

    if status == HCI_SUCCESS {
        if let Some(record) = cm.acl.find_mut(&addr) {
            record.lsto = timeout;
        }
    }

    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::LinkSupervisionTimeoutCfm { app, addr, result });
    cm.complete_and_restore(SubsystemClass::DeviceManager);
}

pub(crate) fn lsto_change_ind(cm: &mut CmContext, addr: BdAddr, timeout: u16) {
    if let Some(record) = cm.acl.find_mut(&addr) {
        record.lsto = timeout;
    }
}
