//! L2CAP connection handlers.

use log::{debug, info, warn};

use crate::context::CmContext;
use crate::controller::{ControllerCommand, HciStatus, HCI_SUCCESS};
use crate::dispatch::{Request, RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::l2cap::types::{L2capConnection, L2capElement, L2capState, Psm, PsmRegistration};
use crate::pending::PendingRequest;
use crate::security::SecurityProtocol;
use crate::types::{AppHandle, BdAddr, ClassOfDevice, ConnId, ElementId};

/// Connected L2CAP contributions toward the peer's stakeholder count.
pub(crate) fn count_connected_to(cm: &CmContext, addr: &BdAddr) -> u8 {
    cm.l2cap
        .elements
        .iter()
        .filter(|e| {
            e.conn
                .as_ref()
                .is_some_and(|c| c.is_connected() && c.addr == *addr)
        })
        .count() as u8
}

pub(crate) fn register_req(cm: &mut CmContext, app: AppHandle, psm: Psm, context: u16) {
    cm.sm.app_handle = app;
    cm.sm.context = context;

    if !psm.is_valid() {
        cm.send_event(CmEvent::L2capRegisterCfm {
            app,
            psm,
            context,
            result: Err(CmError::UnacceptableParameter),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    if cm.l2cap.registration(psm).is_some() {
        cm.send_event(CmEvent::L2capRegisterCfm {
            app,
            psm,
            context,
            result: Err(CmError::AlreadyConnecting),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    cm.send_command(ControllerCommand::L2capRegister { psm });
}

pub(crate) fn register_cfm(cm: &mut CmContext, psm: Psm, success: bool) {
    if cm.sm.serializer.lock_token() != Some(RequestKind::L2capRegister) {
        cm.general_exception("l2cap", "unexpected register confirmation");
        return;
    }

    let app = cm.sm.app_handle;
    let context = cm.sm.context;
    let result = if success {
        cm.l2cap.registrations.push(PsmRegistration { psm, app, context });
        Ok(())
    } else {
        Err(CmError::InternalError)
    };
    cm.send_event(CmEvent::L2capRegisterCfm {
        app,
        psm,
        context,
        result,
    });
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

/// Unregistration does not lock the service queue; the parameters wait in
/// the pending queue until the confirmation pairs them up.
pub(crate) fn unregister_req(cm: &mut CmContext, app: AppHandle, psm: Psm) {
    if cm.l2cap.registration(psm).is_none() {
        cm.send_event(CmEvent::L2capUnregisterCfm {
            app,
            psm,
            result: Err(CmError::UnknownConnection),
        });
        return;
    }

    cm.pending.push(PendingRequest::L2capUnregister { app, psm });
    cm.send_command(ControllerCommand::L2capUnregister { psm });
}

pub(crate) fn unregister_cfm(cm: &mut CmContext, psm: Psm, status: HciStatus) {
    let entry = cm
        .pending
        .remove_matching(|e| matches!(e, PendingRequest::L2capUnregister { psm: p, .. } if *p == psm));

    let Some(PendingRequest::L2capUnregister { app, .. }) = entry else {
        cm.general_exception("l2cap", "unsolicited unregister confirmation");
        return;
    };

    if status == HCI_SUCCESS {
        cm.l2cap.registrations.retain(|r| r.psm != psm);
    }

    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::L2capUnregisterCfm { app, psm, result });
}

pub(crate) fn connect_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: BdAddr,
    psm: Psm,
    remote_psm: Psm,
    context: u16,
    class_of_device: ClassOfDevice,
) {
    if !remote_psm.is_valid() {
        cm.send_event(CmEvent::L2capConnectCfm {
            app,
            addr,
            psm: remote_psm,
            conn_id: None,
            context,
            result: Err(CmError::UnacceptableParameter),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    let id = match cm.alloc_element_id() {
        Ok(id) => id,
        Err(e) => {
            cm.send_event(CmEvent::L2capConnectCfm {
                app,
                addr,
                psm: remote_psm,
                conn_id: None,
                context,
                result: Err(e),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
            return;
        }
    };

    cm.l2cap.elements.push(L2capElement {
        id,
        conn: Some(L2capConnection {
            app,
            addr,
            psm,
            remote_psm,
            context,
            conn_id: None,
            state: L2capState::ConnectInit,
            class_of_device,
            outgoing_mtu: 0,
            incoming_mtu: 0,
            security_registered: false,
        }),
    });
    cm.l2cap.active_element = Some(id);
    cm.l2cap.cancel_connect = false;

    crate::discovery::pause_for_paging(cm);

    // Fill the extended-features cache the first time a channel goes out
    // to this peer.
    let needs_info = cm
        .acl
        .find(&addr)
        .is_some_and(|record| record.extended_features.is_none());
    if needs_info {
        cm.send_command(ControllerCommand::L2capGetInfo { addr });
    }

    cm.send_command(ControllerCommand::L2capConnect {
        addr,
        psm: remote_psm,
    });
}

pub(crate) fn connect_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    psm: Psm,
    conn_id: ConnId,
    status: HciStatus,
) {
    let Some(id) = cm.l2cap.active_element else {
        cm.general_exception("l2cap", "connect confirmation with no active element");
        return;
    };

    let Some(conn) = cm.l2cap.conn(id) else {
        cm.general_exception("l2cap", "connect confirmation for a freed element");
        return;
    };
    if !matches!(
        conn.state,
        L2capState::ConnectInit | L2capState::Connect | L2capState::CancelConnecting
    ) {
        cm.general_exception("l2cap", "connect confirmation in unexpected state");
        return;
    }

    let app = conn.app;
    let context = conn.context;
    let cancelled = cm.l2cap.cancel_connect;

    if status == HCI_SUCCESS && !cancelled {
        if let Some(conn) = cm.l2cap.conn_mut(id) {
            conn.conn_id = Some(conn_id);
            conn.state = L2capState::Connected;
        }
        info!("L2CAP connected: {} psm {}", addr, psm);
        cm.send_event(CmEvent::L2capConnectCfm {
            app,
            addr,
            psm,
            conn_id: Some(conn_id),
            context,
            result: Ok(()),
        });
    } else if status == HCI_SUCCESS && cancelled {
        cm.send_command(ControllerCommand::L2capDisconnect { conn_id });
        free_conn(cm, id);
        cm.send_event(CmEvent::L2capConnectCfm {
            app,
            addr,
            psm,
            conn_id: None,
            context,
            result: Err(CmError::Cancelled),
        });
    } else {
        free_conn(cm, id);
        let result = if cancelled {
            Err(CmError::Cancelled)
        } else {
            Err(CmError::ControllerFailure(status))
        };
        cm.send_event(CmEvent::L2capConnectCfm {
            app,
            addr,
            psm,
            conn_id: None,
            context,
            result,
        });
    }

    cm.l2cap.cancel_connect = false;
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn connect_accept_req(
    cm: &mut CmContext,
    app: AppHandle,
    psm: Psm,
    context: u16,
    class_of_device: ClassOfDevice,
) {
    if cm.l2cap.registration(psm).is_none() {
        cm.send_event(CmEvent::L2capConnectAcceptCfm {
            app,
            addr: BdAddr::ZERO,
            psm,
            conn_id: None,
            context,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    if cm.l2cap.find_accept(psm, context).is_some() {
        cm.send_event(CmEvent::L2capConnectAcceptCfm {
            app,
            addr: BdAddr::ZERO,
            psm,
            conn_id: None,
            context,
            result: Err(CmError::AlreadyConnecting),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    let id = match cm.alloc_element_id() {
        Ok(id) => id,
        Err(e) => {
            cm.send_event(CmEvent::L2capConnectAcceptCfm {
                app,
                addr: BdAddr::ZERO,
                psm,
                conn_id: None,
                context,
                result: Err(e),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
            return;
        }
    };

    cm.l2cap.elements.push(L2capElement {
        id,
        conn: Some(L2capConnection {
            app,
            addr: BdAddr::ZERO,
            psm,
            remote_psm: psm,
            context,
            conn_id: None,
            state: L2capState::Connectable,
            class_of_device,
            outgoing_mtu: 0,
            incoming_mtu: 0,
            security_registered: true,
        }),
    });
    cm.register_security(SecurityProtocol::L2cap(psm));

    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

/// Provider-level cancel; see the RFCOMM counterpart.
pub(crate) fn cancel_accept_provider(cm: &mut CmContext, app: AppHandle, psm: Psm, context: u16) {
    if let Some(id) = cm.l2cap.find_accept(psm, context).map(|e| e.id) {
        if let Some(conn) = cm.l2cap.conn_mut(id) {
            conn.state = L2capState::CancelConnectable;
        }
        cm.route_service_request(Request::L2capCancelConnectAccept { app, psm, context });
        return;
    }

    let removed = cm.sm.serializer.remove_deferred(|r| {
        matches!(r, Request::L2capConnectAccept { psm: p, context: c, .. }
            if *p == psm && *c == context)
    });

    let result = if removed.is_some() {
        Ok(())
    } else {
        Err(CmError::UnknownConnection)
    };
    cm.send_event(CmEvent::L2capCancelAcceptCfm {
        app,
        psm,
        context,
        result,
    });
}

pub(crate) fn cancel_accept_req(cm: &mut CmContext, app: AppHandle, psm: Psm, context: u16) {
    let id = cm.l2cap.elements.iter().find_map(|e| {
        e.conn
            .as_ref()
            .filter(|c| {
                c.psm == psm && c.context == context && c.state == L2capState::CancelConnectable
            })
            .map(|_| e.id)
    });

    match id {
        Some(id) => {
            deregister_security_if_needed(cm, id);
            free_conn(cm, id);
            cm.send_event(CmEvent::L2capCancelAcceptCfm {
                app,
                psm,
                context,
                result: Ok(()),
            });
        }
        None => {
            cm.send_event(CmEvent::L2capCancelAcceptCfm {
                app,
                psm,
                context,
                result: Err(CmError::UnknownConnection),
            });
        }
    }
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn connect_ind(cm: &mut CmContext, addr: BdAddr, psm: Psm, conn_id: ConnId) {
    match cm.l2cap.find_connectable(psm) {
        Some(id) => {
            if let Some(conn) = cm.l2cap.conn_mut(id) {
                conn.addr = addr;
                conn.conn_id = Some(conn_id);
                conn.state = L2capState::ConnectAcceptFinal;
            }
            cm.send_command(ControllerCommand::L2capConnectResponse {
                addr,
                psm,
                accept: true,
            });
        }
        None => {
            warn!("incoming L2CAP connect on unarmed psm {}, rejecting", psm);
            cm.send_command(ControllerCommand::L2capConnectResponse {
                addr,
                psm,
                accept: false,
            });
        }
    }
}

pub(crate) fn connect_complete_ind(cm: &mut CmContext, conn_id: ConnId, status: HciStatus) {
    let Some(id) = cm.l2cap.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.general_exception("l2cap", "connect completion for unknown connection id");
        return;
    };

    let Some(conn) = cm.l2cap.conn(id) else {
        return;
    };
    if conn.state != L2capState::ConnectAcceptFinal {
        cm.general_exception("l2cap", "connect completion in unexpected state");
        return;
    }

    let (app, addr, psm, context) = (conn.app, conn.addr, conn.psm, conn.context);

    if status == HCI_SUCCESS {
        if let Some(conn) = cm.l2cap.conn_mut(id) {
            conn.state = L2capState::Connected;
        }
        info!("L2CAP accepted: {} psm {}", addr, psm);
        cm.send_event(CmEvent::L2capConnectAcceptCfm {
            app,
            addr,
            psm,
            conn_id: Some(conn_id),
            context,
            result: Ok(()),
        });
    } else if let Some(conn) = cm.l2cap.conn_mut(id) {
        conn.addr = BdAddr::ZERO;
        conn.conn_id = None;
        conn.state = L2capState::Connectable;
    }
}

pub(crate) fn get_info_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    status: HciStatus,
    extended_features: u32,
) {
    if status != HCI_SUCCESS {
        debug!("extended features read failed for {}, cache stays cold", addr);
        return;
    }
    if let Some(record) = cm.acl.find_mut(&addr) {
        record.extended_features = Some(extended_features);
    }
}

pub(crate) fn disconnect_req(cm: &mut CmContext, app: AppHandle, conn_id: ConnId, context: u16) {
    let Some(id) = cm.l2cap.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.send_event(CmEvent::L2capDisconnectCfm {
            app,
            conn_id,
            context,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    };

    let connected = cm
        .l2cap
        .conn(id)
        .is_some_and(|c| c.state == L2capState::Connected);
    if !connected {
        cm.send_event(CmEvent::L2capDisconnectCfm {
            app,
            conn_id,
            context,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    if let Some(conn) = cm.l2cap.conn_mut(id) {
        conn.state = L2capState::Release;
    }
    cm.send_command(ControllerCommand::L2capDisconnect { conn_id });
}

pub(crate) fn disconnect_cfm(cm: &mut CmContext, conn_id: ConnId, status: HciStatus) {
    let Some(id) = cm.l2cap.find_by_conn_id(conn_id).map(|e| e.id) else {
        debug!("L2CAP disconnect confirmation for untracked connection");
        return;
    };

    let (app, context) = match cm.l2cap.conn(id) {
        Some(c) => (c.app, c.context),
        None => return,
    };

    terminal_cleanup(cm, id);
    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::L2capDisconnectCfm {
        app,
        conn_id,
        context,
        result,
    });
    if cm.sm.serializer.lock_token() == Some(RequestKind::L2capDisconnect) {
        cm.complete_and_restore(SubsystemClass::ServiceManager);
    }
}

pub(crate) fn disconnect_ind(cm: &mut CmContext, conn_id: ConnId, reason: HciStatus) {
    let Some(id) = cm.l2cap.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.general_exception("l2cap", "disconnect indication for unknown connection id");
        return;
    };

    let (app, context, addr) = match cm.l2cap.conn(id) {
        Some(c) => (c.app, c.context, c.addr),
        None => return,
    };

    terminal_cleanup(cm, id);
    cm.send_event(CmEvent::L2capDisconnectInd {
        app,
        conn_id,
        context,
        reason,
    });
    cm.notify_service_disconnected(addr);
    cm.purge_unused_elements();
}

/// ACL went down: complete outgoing connects that will never see their own
/// indication.
pub(crate) fn acl_closed(cm: &mut CmContext, addr: &BdAddr, reason: HciStatus) {
    let ids: Vec<ElementId> = cm
        .l2cap
        .elements
        .iter()
        .filter(|e| e.conn.as_ref().is_some_and(|c| c.addr == *addr))
        .map(|e| e.id)
        .collect();

    for id in ids {
        let state = cm.l2cap.conn(id).map(|c| c.state);
        if state == Some(L2capState::ConnectInit) {
            let (app, a, psm, context) = {
                let Some(c) = cm.l2cap.conn(id) else { continue };
                (c.app, c.addr, c.remote_psm, c.context)
            };
            free_conn(cm, id);
            cm.send_event(CmEvent::L2capConnectCfm {
                app,
                addr: a,
                psm,
                conn_id: None,
                context,
                result: Err(CmError::ControllerFailure(reason)),
            });
            if cm.sm.serializer.lock_token() == Some(RequestKind::L2capConnect)
                && cm.l2cap.active_element == Some(id)
            {
                cm.complete_and_restore(SubsystemClass::ServiceManager);
            }
        }
    }
}

fn deregister_security_if_needed(cm: &mut CmContext, id: ElementId) {
    let dereg = cm.l2cap.conn_mut(id).and_then(|c| {
        if c.security_registered {
            c.security_registered = false;
            Some(c.psm)
        } else {
            None
        }
    });
    if let Some(psm) = dereg {
        cm.deregister_security(SecurityProtocol::L2cap(psm));
    }
}

fn terminal_cleanup(cm: &mut CmContext, id: ElementId) {
    deregister_security_if_needed(cm, id);
    free_conn(cm, id);
}

pub(crate) fn free_conn(cm: &mut CmContext, id: ElementId) {
    if let Some(element) = cm.l2cap.element_mut(id) {
        element.conn = None;
    }
}
