//! RFCOMM connection handlers.

use log::{debug, info, warn};

use crate::context::CmContext;
use crate::controller::{ControllerCommand, HciStatus, HCI_SUCCESS};
use crate::dispatch::{Request, RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::rfc::types::{RfcConnection, RfcElement, RfcState};
use crate::security::SecurityProtocol;
use crate::types::{AppHandle, BdAddr, ClassOfDevice, ConnId, ElementId, ServerChannel};

/// Connected RFCOMM contributions toward the peer's stakeholder count.
pub(crate) fn count_connected_to(cm: &CmContext, addr: &BdAddr) -> u8 {
    cm.rfc
        .elements
        .iter()
        .filter(|e| {
            e.conn
                .as_ref()
                .is_some_and(|c| c.is_connected() && c.addr == *addr)
        })
        .count() as u8
}

pub(crate) fn register_req(
    cm: &mut CmContext,
    app: AppHandle,
    server_channel: ServerChannel,
    context: u16,
) {
    cm.sm.app_handle = app;
    cm.sm.context = context;
    cm.sm.registering_channel = server_channel;
    cm.send_command(ControllerCommand::RfcRegister { server_channel });
}

pub(crate) fn register_cfm(cm: &mut CmContext, server_channel: ServerChannel, success: bool) {
    if cm.sm.serializer.lock_token() != Some(RequestKind::RfcRegister) {
        cm.general_exception("rfc", "unexpected register confirmation");
        return;
    }

    let app = cm.sm.app_handle;
    let context = cm.sm.context;
    let result = if success {
        Ok(())
    } else {
        Err(CmError::InternalError)
    };
    cm.send_event(CmEvent::RfcRegisterCfm {
        app,
        server_channel,
        context,
        result,
    });
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn connect_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: BdAddr,
    server_channel: ServerChannel,
    context: u16,
    class_of_device: ClassOfDevice,
    max_frame_size: u16,
) {
    let id = match cm.alloc_element_id() {
        Ok(id) => id,
        Err(e) => {
            cm.send_event(CmEvent::RfcConnectCfm {
                app,
                addr,
                server_channel,
                conn_id: None,
                context,
                result: Err(e),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
            return;
        }
    };

    cm.rfc.elements.push(RfcElement {
        id,
        conn: Some(RfcConnection {
            app,
            addr,
            server_channel,
            remote_server_channel: server_channel,
            context,
            conn_id: None,
            state: RfcState::ConnectInit,
            class_of_device,
            max_frame_size,
            sco: None,
            accept_timeout: None,
            security_registered: false,
        }),
    });
    cm.rfc.active_element = Some(id);
    cm.rfc.cancel_connect = false;

    // Paging would fight an active inquiry for the radio.
    crate::discovery::pause_for_paging(cm);

    cm.send_command(ControllerCommand::RfcConnect {
        addr,
        server_channel,
        max_frame_size,
    });
}

pub(crate) fn connect_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    server_channel: ServerChannel,
    conn_id: ConnId,
    status: HciStatus,
) {
    let Some(id) = cm.rfc.active_element else {
        cm.general_exception("rfc", "connect confirmation with no active element");
        return;
    };

    let Some(conn) = cm.rfc.conn_mut(id) else {
        cm.general_exception("rfc", "connect confirmation for a freed element");
        return;
    };

    if !matches!(conn.state, RfcState::ConnectInit | RfcState::Connect | RfcState::CancelConnecting) {
        cm.general_exception("rfc", "connect confirmation in unexpected state");
        return;
    }

    let app = conn.app;
    let context = conn.context;
    let cancelled = cm.rfc.cancel_connect;

    if status == HCI_SUCCESS && !cancelled {
        if let Some(conn) = cm.rfc.conn_mut(id) {
            conn.conn_id = Some(conn_id);
            conn.state = RfcState::Connected;
        }
        info!("RFCOMM connected: {} channel {}", addr, server_channel);
        cm.send_event(CmEvent::RfcConnectCfm {
            app,
            addr,
            server_channel,
            conn_id: Some(conn_id),
            context,
            result: Ok(()),
        });
    } else if status == HCI_SUCCESS && cancelled {
        // Connect completed under our cancel; tear the channel straight
        // back down and report the cancellation.
        cm.send_command(ControllerCommand::RfcRelease { conn_id });
        free_conn(cm, id);
        cm.send_event(CmEvent::RfcConnectCfm {
            app,
            addr,
            server_channel,
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
        cm.send_event(CmEvent::RfcConnectCfm {
            app,
            addr,
            server_channel,
            conn_id: None,
            context,
            result,
        });
    }

    cm.rfc.cancel_connect = false;
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn cancel_connect_req(
    cm: &mut CmContext,
    app: AppHandle,
    addr: BdAddr,
    server_channel: ServerChannel,
) {
    // An in-flight connect cannot be recalled from the controller; mark it
    // and synthesize the cancelled outcome when the confirmation arrives.
    let in_flight = cm.sm.serializer.lock_token() == Some(RequestKind::RfcConnect)
        && cm.rfc.active_element.is_some_and(|id| {
            cm.rfc
                .conn(id)
                .is_some_and(|c| c.addr == addr && c.remote_server_channel == server_channel)
        });

    if in_flight {
        cm.rfc.cancel_connect = true;
        if let Some(id) = cm.rfc.active_element {
            if let Some(conn) = cm.rfc.conn_mut(id) {
                conn.state = RfcState::CancelConnecting;
            }
        }
        return;
    }

    // Not dispatched yet: pull it out of the save queue, clean.
    let removed = cm.sm.serializer.remove_deferred(|r| {
        matches!(r, Request::RfcConnect { app: a, addr: ad, server_channel: sc, .. }
            if *a == app && *ad == addr && *sc == server_channel)
    });

    if let Some(Request::RfcConnect { context, .. }) = removed {
        cm.send_event(CmEvent::RfcConnectCfm {
            app,
            addr,
            server_channel,
            conn_id: None,
            context,
            result: Err(CmError::Cancelled),
        });
    } else {
        warn!("RFCOMM cancel connect: nothing to cancel for {}", addr);
    }
}

pub(crate) fn connect_accept_req(
    cm: &mut CmContext,
    app: AppHandle,
    server_channel: ServerChannel,
    context: u16,
    accept_timeout: Option<u16>,
    class_of_device: ClassOfDevice,
) {
    // Exactly one outstanding registration per (server channel, context).
    if cm.rfc.find_accept(server_channel, context).is_some() {
        cm.send_event(CmEvent::RfcConnectAcceptCfm {
            app,
            addr: BdAddr::ZERO,
            server_channel,
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
            cm.send_event(CmEvent::RfcConnectAcceptCfm {
                app,
                addr: BdAddr::ZERO,
                server_channel,
                conn_id: None,
                context,
                result: Err(e),
            });
            cm.complete_and_restore(SubsystemClass::ServiceManager);
            return;
        }
    };

    cm.rfc.elements.push(RfcElement {
        id,
        conn: Some(RfcConnection {
            app,
            addr: BdAddr::ZERO,
            server_channel,
            remote_server_channel: 0,
            context,
            conn_id: None,
            state: RfcState::Connectable,
            class_of_device,
            max_frame_size: 0,
            sco: None,
            accept_timeout,
            security_registered: true,
        }),
    });
    cm.register_security(SecurityProtocol::Rfcomm(server_channel));

    // The registration stays pending until a connection lands on it, it
    // times out, or it is cancelled.
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn accept_timeout(cm: &mut CmContext, server_channel: ServerChannel, context: u16) {
    let Some(id) = cm
        .rfc
        .find_accept(server_channel, context)
        .filter(|e| e.conn.as_ref().is_some_and(|c| c.state == RfcState::Connectable))
        .map(|e| e.id)
    else {
        // Raced with an incoming connection or a cancel; nothing to expire.
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    };

    let (app, ctx) = {
        let Some(conn) = cm.rfc.conn(id) else {
            cm.complete_and_restore(SubsystemClass::ServiceManager);
            return;
        };
        (conn.app, conn.context)
    };

    deregister_security_if_needed(cm, id);
    free_conn(cm, id);
    cm.send_event(CmEvent::RfcConnectAcceptCfm {
        app,
        addr: BdAddr::ZERO,
        server_channel,
        conn_id: None,
        context: ctx,
        result: Err(CmError::Cancelled),
    });
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

/// Provider-level cancel: runs on arrival, before the serializer, because
/// the registration being cancelled may itself still be parked in the save
/// queue.
pub(crate) fn cancel_accept_provider(
    cm: &mut CmContext,
    app: AppHandle,
    server_channel: ServerChannel,
    context: u16,
) {
    if let Some(id) = cm.rfc.find_accept(server_channel, context).map(|e| e.id) {
        // Registration is live: mark it and run the cancel through the
        // serializer like any other service request.
        if let Some(conn) = cm.rfc.conn_mut(id) {
            conn.state = RfcState::CancelConnectable;
        }
        cm.route_service_request(Request::RfcCancelConnectAccept {
            app,
            server_channel,
            context,
        });
        return;
    }

    // Either still parked in the save queue, or nothing to cancel.
    let removed = cm.sm.serializer.remove_deferred(|r| {
        matches!(r, Request::RfcConnectAccept { server_channel: sc, context: c, .. }
            if *sc == server_channel && *c == context)
    });

    let result = if removed.is_some() {
        Ok(())
    } else {
        Err(CmError::UnknownConnection)
    };
    cm.send_event(CmEvent::RfcCancelAcceptCfm {
        app,
        server_channel,
        context,
        result,
    });
}

/// Serializer-dispatched half of accept cancellation.
pub(crate) fn cancel_accept_req(
    cm: &mut CmContext,
    app: AppHandle,
    server_channel: ServerChannel,
    context: u16,
) {
    let id = cm.rfc.elements.iter().find_map(|e| {
        e.conn
            .as_ref()
            .filter(|c| {
                c.server_channel == server_channel
                    && c.context == context
                    && c.state == RfcState::CancelConnectable
            })
            .map(|_| e.id)
    });

    match id {
        Some(id) => {
            deregister_security_if_needed(cm, id);
            free_conn(cm, id);
            cm.send_event(CmEvent::RfcCancelAcceptCfm {
                app,
                server_channel,
                context,
                result: Ok(()),
            });
        }
        None => {
            // The registration completed (or expired) while the cancel
            // waited its turn.
            cm.send_event(CmEvent::RfcCancelAcceptCfm {
                app,
                server_channel,
                context,
                result: Err(CmError::UnknownConnection),
            });
        }
    }
    cm.complete_and_restore(SubsystemClass::ServiceManager);
}

pub(crate) fn connect_ind(
    cm: &mut CmContext,
    addr: BdAddr,
    server_channel: ServerChannel,
    conn_id: ConnId,
) {
    match cm.rfc.find_connectable(server_channel) {
        Some(id) => {
            if let Some(conn) = cm.rfc.conn_mut(id) {
                conn.addr = addr;
                conn.conn_id = Some(conn_id);
                conn.state = RfcState::ConnectAcceptFinal;
            }
            cm.send_command(ControllerCommand::RfcConnectResponse {
                addr,
                server_channel,
                accept: true,
            });
        }
        None => {
            warn!(
                "incoming RFCOMM connect on unregistered channel {}, rejecting",
                server_channel
            );
            cm.send_command(ControllerCommand::RfcConnectResponse {
                addr,
                server_channel,
                accept: false,
            });
        }
    }
}

pub(crate) fn connect_complete_ind(cm: &mut CmContext, conn_id: ConnId, status: HciStatus) {
    let Some(id) = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.general_exception("rfc", "connect completion for unknown connection id");
        return;
    };

    let Some(conn) = cm.rfc.conn_mut(id) else {
        return;
    };
    if conn.state != RfcState::ConnectAcceptFinal {
        cm.general_exception("rfc", "connect completion in unexpected state");
        return;
    }

    let (app, addr, server_channel, context) =
        (conn.app, conn.addr, conn.server_channel, conn.context);

    if status == HCI_SUCCESS {
        if let Some(conn) = cm.rfc.conn_mut(id) {
            conn.state = RfcState::Connected;
        }
        info!("RFCOMM accepted: {} channel {}", addr, server_channel);
        cm.send_event(CmEvent::RfcConnectAcceptCfm {
            app,
            addr,
            server_channel,
            conn_id: Some(conn_id),
            context,
            result: Ok(()),
        });
    } else if let Some(conn) = cm.rfc.conn_mut(id) {
        // Setup fell over; re-arm the registration.
        conn.addr = BdAddr::ZERO;
        conn.conn_id = None;
        conn.state = RfcState::Connectable;
    }
}

pub(crate) fn release_req(cm: &mut CmContext, app: AppHandle, conn_id: ConnId, context: u16) {
    let Some(id) = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.send_event(CmEvent::RfcDisconnectCfm {
            app,
            conn_id,
            context,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    };

    let Some(conn) = cm.rfc.conn_mut(id) else {
        return;
    };
    if conn.state != RfcState::Connected {
        let app_ctx = conn.context;
        cm.send_event(CmEvent::RfcDisconnectCfm {
            app,
            conn_id,
            context: app_ctx,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::ServiceManager);
        return;
    }

    conn.state = RfcState::Release;

    // A live eSCO child link must come down before the channel; the
    // protocol release waits for the synchronous disconnect confirmation.
    if let Some(sco) = conn.sco.as_mut() {
        if let Some(handle) = sco.handle {
            sco.close_pending = true;
            sco.release_after_disconnect = true;
            cm.send_command(ControllerCommand::SyncDisconnect {
                handle,
                reason: crate::controller::HCI_ERROR_OETC_USER,
            });
            return;
        }
    }

    cm.send_command(ControllerCommand::RfcRelease { conn_id });
}

/// Continues a release that was parked behind a SCO teardown.
pub(crate) fn continue_deferred_release(cm: &mut CmContext, id: ElementId) {
    if let Some(conn) = cm.rfc.conn(id) {
        if conn.state == RfcState::Release {
            if let Some(conn_id) = conn.conn_id {
                cm.send_command(ControllerCommand::RfcRelease { conn_id });
            }
        }
    }
}

pub(crate) fn release_cfm(cm: &mut CmContext, conn_id: ConnId, status: HciStatus) {
    let Some(id) = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id) else {
        // A release issued for a cancelled connect has no element left.
        debug!("release confirmation for untracked connection");
        return;
    };

    let (app, context) = match cm.rfc.conn(id) {
        Some(c) => (c.app, c.context),
        None => return,
    };

    terminal_cleanup(cm, id);
    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::RfcDisconnectCfm {
        app,
        conn_id,
        context,
        result,
    });
    if cm.sm.serializer.lock_token() == Some(RequestKind::RfcDisconnect) {
        cm.complete_and_restore(SubsystemClass::ServiceManager);
    }
}

pub(crate) fn release_ind(cm: &mut CmContext, conn_id: ConnId, reason: HciStatus) {
    let Some(id) = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id) else {
        cm.general_exception("rfc", "release indication for unknown connection id");
        return;
    };

    let (app, context, addr) = match cm.rfc.conn(id) {
        Some(c) => (c.app, c.context, c.addr),
        None => return,
    };

    terminal_cleanup(cm, id);
    cm.send_event(CmEvent::RfcDisconnectInd {
        app,
        conn_id,
        context,
        reason,
    });
    cm.notify_service_disconnected(addr);
    cm.purge_unused_elements();
}

/// ACL went down: complete outgoing connects that will never see their own
/// confirmation, and release audio resources held by channels on the link.
pub(crate) fn acl_closed(cm: &mut CmContext, addr: &BdAddr, reason: HciStatus) {
    let ids: Vec<ElementId> = cm
        .rfc
        .elements
        .iter()
        .filter(|e| e.conn.as_ref().is_some_and(|c| c.addr == *addr))
        .map(|e| e.id)
        .collect();

    for id in ids {
        // Free any audio slot first, whatever state the channel is in.
        if let Some(conn) = cm.rfc.conn_mut(id) {
            if let Some(sco) = conn.sco.take() {
                if let Some(slot) = sco.pcm_slot {
                    cm.pcm.release_index(slot);
                }
            }
        }

        let state = cm.rfc.conn(id).map(|c| c.state);
        if state == Some(RfcState::ConnectInit) {
            let (app, a, sc, context) = {
                let Some(c) = cm.rfc.conn(id) else { continue };
                (c.app, c.addr, c.remote_server_channel, c.context)
            };
            free_conn(cm, id);
            cm.send_event(CmEvent::RfcConnectCfm {
                app,
                addr: a,
                server_channel: sc,
                conn_id: None,
                context,
                result: Err(CmError::ControllerFailure(reason)),
            });
            if cm.sm.serializer.lock_token() == Some(RequestKind::RfcConnect)
                && cm.rfc.active_element == Some(id)
            {
                cm.complete_and_restore(SubsystemClass::ServiceManager);
            }
        }
    }
}

fn deregister_security_if_needed(cm: &mut CmContext, id: ElementId) {
    let dereg = cm.rfc.conn_mut(id).and_then(|c| {
        if c.security_registered {
            c.security_registered = false;
            Some(c.server_channel)
        } else {
            None
        }
    });
    if let Some(channel) = dereg {
        cm.deregister_security(SecurityProtocol::Rfcomm(channel));
    }
}

/// Terminal disconnect cleanup: security registration, PCM slot, element.
fn terminal_cleanup(cm: &mut CmContext, id: ElementId) {
    deregister_security_if_needed(cm, id);
    if let Some(conn) = cm.rfc.conn_mut(id) {
        if let Some(sco) = conn.sco.take() {
            if let Some(handle) = sco.handle {
                cm.pcm.release_handle(handle);
            } else if let Some(slot) = sco.pcm_slot {
                cm.pcm.release_index(slot);
            }
        }
    }
    free_conn(cm, id);
}

/// Frees the connection instance. The element itself (and its id) survives
/// until the next house-cleaning pass.
pub(crate) fn free_conn(cm: &mut CmContext, id: ElementId) {
    if let Some(element) = cm.rfc.element_mut(id) {
        element.conn = None;
    }
}
