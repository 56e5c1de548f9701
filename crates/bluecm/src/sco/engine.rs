//! Synchronous-link handlers.

use log::{debug, info, warn};

use crate::context::CmContext;
use crate::controller::{
    ControllerCommand, HciStatus, SyncLinkType, HCI_ERROR_OETC_USER,
    HCI_ERROR_REJECTED_DUE_TO_LIMITED_RESOURCES, HCI_ERROR_UNSUPPORTED_REMOTE_FEATURE,
    HCI_SUCCESS,
};
use crate::dispatch::{RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::rfc::{self, RfcState, ScoLink};
use crate::sco::negotiate::{NegotiationCursor, SyncNegotiatedParams, SyncParams};
use crate::types::{AppHandle, BdAddr, ConnId, ElementId, ScoHandle};

/// State of the one in-flight synchronous negotiation. Stored on the
/// device-manager side because the controller serializes synchronous setup
/// there.
#[derive(Debug)]
pub struct ScoNegotiation {
    pub element: ElementId,
    pub app: AppHandle,
    pub cursor: NegotiationCursor,
    pub incoming: bool,
}

/// Builds the candidate cursor for a link to `addr`, from the local
/// feature bitmap and the peer's cached one.
pub(crate) fn build_candidates(
    cm: &CmContext,
    addr: &BdAddr,
    requested: &[SyncParams],
) -> Result<NegotiationCursor, CmError> {
    let record = cm.acl.find_or_fail(addr)?;
    Ok(NegotiationCursor::build(
        requested,
        &cm.dm.local_features,
        &record.remote_features,
        record.encryption,
    ))
}

fn find_element_by_sco_handle(cm: &CmContext, handle: ScoHandle) -> Option<ElementId> {
    cm.rfc
        .elements
        .iter()
        .find(|e| {
            e.conn
                .as_ref()
                .and_then(|c| c.sco.as_ref())
                .is_some_and(|s| s.handle == Some(handle))
        })
        .map(|e| e.id)
}

fn find_accepting_element(cm: &CmContext, addr: &BdAddr) -> Option<ElementId> {
    cm.rfc
        .elements
        .iter()
        .find(|e| {
            e.conn.as_ref().is_some_and(|c| {
                c.addr == *addr && c.sco.as_ref().is_some_and(|s| s.accept_armed)
            })
        })
        .map(|e| e.id)
}

pub(crate) fn connect_req(
    cm: &mut CmContext,
    app: AppHandle,
    conn_id: ConnId,
    requested: Vec<SyncParams>,
) {
    let element = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id);
    let Some(id) = element else {
        cm.send_event(CmEvent::ScoConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    };

    let (addr, has_sco, connected) = {
        let Some(conn) = cm.rfc.conn(id) else { return };
        (conn.addr, conn.sco.is_some(), conn.is_connected())
    };

    if !connected || has_sco {
        let result = if has_sco {
            Err(CmError::AlreadyConnecting)
        } else {
            Err(CmError::UnknownConnection)
        };
        cm.send_event(CmEvent::ScoConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result,
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    let cursor = match build_candidates(cm, &addr, &requested) {
        Ok(cursor) if !cursor.is_empty() => cursor,
        Ok(_) => {
            cm.send_event(CmEvent::ScoConnectCfm {
                app,
                conn_id,
                handle: None,
                negotiated: None,
                result: Err(CmError::UnsupportedFeature),
            });
            cm.complete_and_restore(SubsystemClass::DeviceManager);
            return;
        }
        Err(e) => {
            cm.send_event(CmEvent::ScoConnectCfm {
                app,
                conn_id,
                handle: None,
                negotiated: None,
                result: Err(e),
            });
            cm.complete_and_restore(SubsystemClass::DeviceManager);
            return;
        }
    };

    let Some(slot) = cm.pcm.reserve() else {
        cm.send_event(CmEvent::ScoConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result: Err(CmError::InternalError),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    };

    let first = cursor.current();
    if let Some(conn) = cm.rfc.conn_mut(id) {
        conn.sco = Some(ScoLink {
            pcm_slot: Some(slot),
            ..ScoLink::default()
        });
    }
    cm.dm.sco_negotiation = Some(ScoNegotiation {
        element: id,
        app,
        cursor,
        incoming: false,
    });

    if let Some(params) = first {
        cm.send_command(ControllerCommand::SyncConnect { addr, params });
    }
}

pub(crate) fn sync_connect_cfm(
    cm: &mut CmContext,
    addr: BdAddr,
    handle: ScoHandle,
    status: HciStatus,
    negotiated: Option<SyncNegotiatedParams>,
) {
    let Some(neg) = cm.dm.sco_negotiation.as_mut() else {
        cm.general_exception("sco", "connect confirmation with no negotiation in flight");
        return;
    };
    if neg.incoming {
        cm.general_exception("sco", "connect confirmation during incoming negotiation");
        return;
    }

    let id = neg.element;
    let app = neg.app;
    let conn_id = cm.rfc.conn(id).and_then(|c| c.conn_id).unwrap_or_default();

    if status == HCI_SUCCESS {
        info!("eSCO up: {} handle 0x{:04X}", addr, handle);
        let slot = cm.rfc.conn(id).and_then(|c| c.sco.as_ref()).and_then(|s| s.pcm_slot);
        if let Some(slot) = slot {
            cm.pcm.assign(slot, handle);
        }
        if let Some(conn) = cm.rfc.conn_mut(id) {
            if let Some(sco) = conn.sco.as_mut() {
                sco.handle = Some(handle);
                sco.negotiated = negotiated;
            }
        }
        cm.dm.sco_negotiation = None;
        cm.send_event(CmEvent::ScoConnectCfm {
            app,
            conn_id,
            handle: Some(handle),
            negotiated,
            result: Ok(()),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    // Try the next acceptable parameter set; the queue stays locked while
    // the negotiation walks its candidates.
    let next = cm
        .dm
        .sco_negotiation
        .as_mut()
        .and_then(|neg| neg.cursor.advance());

    match next {
        Some(params) => {
            debug!("eSCO negotiation round failed (0x{:02X}), retrying", status);
            cm.send_command(ControllerCommand::SyncConnect { addr, params });
        }
        None => {
            // Exhausted: reject the audio connection.
            let slot = cm.rfc.conn(id).and_then(|c| c.sco.as_ref()).and_then(|s| s.pcm_slot);
            if let Some(slot) = slot {
                cm.pcm.release_index(slot);
            }
            if let Some(conn) = cm.rfc.conn_mut(id) {
                conn.sco = None;
            }
            cm.dm.sco_negotiation = None;
            cm.send_event(CmEvent::ScoConnectCfm {
                app,
                conn_id,
                handle: None,
                negotiated: None,
                result: Err(CmError::ControllerFailure(status)),
            });
            cm.complete_and_restore(SubsystemClass::DeviceManager);
        }
    }
}

pub(crate) fn accept_connect_req(
    cm: &mut CmContext,
    app: AppHandle,
    conn_id: ConnId,
    params: Vec<SyncParams>,
) {
    let element = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id);
    let Some(id) = element else {
        cm.send_event(CmEvent::ScoAcceptConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    };

    let already = cm
        .rfc
        .conn(id)
        .and_then(|c| c.sco.as_ref())
        .is_some();
    if already {
        cm.send_event(CmEvent::ScoAcceptConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result: Err(CmError::AlreadyConnecting),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    let Some(slot) = cm.pcm.reserve() else {
        cm.send_event(CmEvent::ScoAcceptConnectCfm {
            app,
            conn_id,
            handle: None,
            negotiated: None,
            result: Err(CmError::InternalError),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    };

    if let Some(conn) = cm.rfc.conn_mut(id) {
        conn.sco = Some(ScoLink {
            accept_armed: true,
            accept_params: params,
            pcm_slot: Some(slot),
            ..ScoLink::default()
        });
    }

    // The registration completes when a synchronous connection actually
    // lands; the queue must not wait for that.
    cm.complete_and_restore(SubsystemClass::DeviceManager);
}

pub(crate) fn cancel_accept_req(cm: &mut CmContext, app: AppHandle, conn_id: ConnId) {
    let element = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id);
    let Some(id) = element else {
        cm.send_event(CmEvent::ScoCancelAcceptCfm {
            app,
            conn_id,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    };

    let armed = cm
        .rfc
        .conn(id)
        .and_then(|c| c.sco.as_ref())
        .is_some_and(|s| s.accept_armed && s.handle.is_none());
    if !armed {
        cm.send_event(CmEvent::ScoCancelAcceptCfm {
            app,
            conn_id,
            result: Err(CmError::UnknownConnection),
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
        return;
    }

    let setup_in_progress = cm
        .dm
        .sco_negotiation
        .as_ref()
        .is_some_and(|n| n.incoming && n.element == id);

    if setup_in_progress {
        // The controller cannot un-issue the accept already in flight;
        // mark the link and synthesize the teardown when setup completes.
        if let Some(conn) = cm.rfc.conn_mut(id) {
            if let Some(sco) = conn.sco.as_mut() {
                sco.close_pending = true;
            }
        }
    } else {
        let slot = cm.rfc.conn(id).and_then(|c| c.sco.as_ref()).and_then(|s| s.pcm_slot);
        if let Some(slot) = slot {
            cm.pcm.release_index(slot);
        }
        if let Some(conn) = cm.rfc.conn_mut(id) {
            conn.sco = None;
        }
    }

    cm.send_event(CmEvent::ScoCancelAcceptCfm {
        app,
        conn_id,
        result: Ok(()),
    });
    cm.complete_and_restore(SubsystemClass::DeviceManager);
}

/// Incoming synchronous-connection indication: the engine supplies the
/// acceptable response parameters, role-reversed.
pub(crate) fn sync_connect_ind(cm: &mut CmContext, addr: BdAddr, link_type: SyncLinkType) {
    let Some(id) = find_accepting_element(cm, &addr) else {
        debug!("incoming sync connect from {} with no acceptor, rejecting", addr);
        cm.send_command(ControllerCommand::SyncConnectResponse {
            addr,
            params: None,
            reason: HCI_ERROR_REJECTED_DUE_TO_LIMITED_RESOURCES,
        });
        return;
    };

    let (app, accept_params) = {
        let Some(conn) = cm.rfc.conn(id) else { return };
        let Some(sco) = conn.sco.as_ref() else { return };
        (conn.app, sco.accept_params.clone())
    };

    let mut cursor = match build_candidates(cm, &addr, &accept_params) {
        Ok(cursor) => cursor,
        Err(_) => {
            cm.send_command(ControllerCommand::SyncConnectResponse {
                addr,
                params: None,
                reason: HCI_ERROR_REJECTED_DUE_TO_LIMITED_RESOURCES,
            });
            return;
        }
    };

    // A legacy SCO request can only be answered with SCO packet types.
    let response = if link_type == SyncLinkType::Sco {
        cursor.seek_sco_only()
    } else {
        cursor.current()
    };

    match response {
        Some(params) => {
            cm.dm.sco_negotiation = Some(ScoNegotiation {
                element: id,
                app,
                cursor,
                incoming: true,
            });
            cm.send_command(ControllerCommand::SyncConnectResponse {
                addr,
                params: Some(params),
                reason: HCI_SUCCESS,
            });
        }
        None => {
            cm.send_command(ControllerCommand::SyncConnectResponse {
                addr,
                params: None,
                reason: HCI_ERROR_UNSUPPORTED_REMOTE_FEATURE,
            });
        }
    }
}

pub(crate) fn sync_connect_complete_ind(
    cm: &mut CmContext,
    addr: BdAddr,
    handle: ScoHandle,
    status: HciStatus,
    negotiated: Option<SyncNegotiatedParams>,
) {
    let Some(neg) = cm.dm.sco_negotiation.take() else {
        debug!("sync connect completion from {} with no negotiation", addr);
        return;
    };
    if !neg.incoming {
        cm.dm.sco_negotiation = Some(neg);
        cm.general_exception("sco", "incoming completion during outgoing negotiation");
        return;
    }

    let id = neg.element;
    let app = neg.app;
    let conn_id = cm.rfc.conn(id).and_then(|c| c.conn_id).unwrap_or_default();

    if status != HCI_SUCCESS {
        // Setup failed; the registration stays armed for the next attempt.
        debug!("incoming sync setup failed (0x{:02X}), re-arming", status);
        return;
    }

    let close_pending = cm
        .rfc
        .conn(id)
        .and_then(|c| c.sco.as_ref())
        .is_some_and(|s| s.close_pending);

    if close_pending {
        // Accept was cancelled during setup: the link exists at the
        // controller but not for the application. Take it down silently.
        if let Some(conn) = cm.rfc.conn_mut(id) {
            if let Some(sco) = conn.sco.as_mut() {
                sco.handle = Some(handle);
                sco.accept_armed = false;
            }
        }
        cm.send_command(ControllerCommand::SyncDisconnect {
            handle,
            reason: HCI_ERROR_OETC_USER,
        });
        return;
    }

    let slot = cm.rfc.conn(id).and_then(|c| c.sco.as_ref()).and_then(|s| s.pcm_slot);
    if let Some(slot) = slot {
        cm.pcm.assign(slot, handle);
    }
    if let Some(conn) = cm.rfc.conn_mut(id) {
        if let Some(sco) = conn.sco.as_mut() {
            sco.handle = Some(handle);
            sco.accept_armed = false;
            sco.negotiated = negotiated;
        }
    }
    info!("eSCO accepted: {} handle 0x{:04X}", addr, handle);
    cm.send_event(CmEvent::ScoAcceptConnectCfm {
        app,
        conn_id,
        handle: Some(handle),
        negotiated,
        result: Ok(()),
    });
}

pub(crate) fn disconnect_req(
    cm: &mut CmContext,
    app: AppHandle,
    conn_id: ConnId,
    reason: HciStatus,
) {
    let element = cm.rfc.find_by_conn_id(conn_id).map(|e| e.id);
    let handle = element.and_then(|id| {
        cm.rfc
            .conn(id)
            .and_then(|c| c.sco.as_ref())
            .and_then(|s| s.handle)
    });

    match (element, handle) {
        (Some(id), Some(handle)) => {
            if let Some(conn) = cm.rfc.conn_mut(id) {
                if let Some(sco) = conn.sco.as_mut() {
                    sco.close_pending = true;
                }
            }
            cm.send_command(ControllerCommand::SyncDisconnect { handle, reason });
        }
        _ => {
            cm.send_event(CmEvent::ScoDisconnectCfm {
                app,
                conn_id,
                handle: 0,
                result: Err(CmError::UnknownConnection),
            });
            cm.complete_and_restore(SubsystemClass::DeviceManager);
        }
    }
}

pub(crate) fn sync_disconnect_cfm(cm: &mut CmContext, handle: ScoHandle, status: HciStatus) {
    cm.pcm.release_handle(handle);

    let Some(id) = find_element_by_sco_handle(cm, handle) else {
        debug!("sync disconnect confirmation for untracked handle 0x{:04X}", handle);
        return;
    };

    let (app, conn_id, release_after, state, slot) = {
        let Some(conn) = cm.rfc.conn(id) else { return };
        let release_after = conn
            .sco
            .as_ref()
            .is_some_and(|s| s.release_after_disconnect);
        let slot = conn.sco.as_ref().and_then(|s| s.pcm_slot);
        (
            conn.app,
            conn.conn_id.unwrap_or_default(),
            release_after,
            conn.state,
            slot,
        )
    };

    // A slot still only reserved (cancelled mid-setup) has no handle to
    // release it by.
    if let Some(slot) = slot {
        cm.pcm.release_index(slot);
    }
    if let Some(conn) = cm.rfc.conn_mut(id) {
        conn.sco = None;
    }

    if release_after && state == RfcState::Release {
        // The channel release was parked behind this teardown.
        rfc::continue_deferred_release(cm, id);
        return;
    }

    if cm.dm.serializer.lock_token() == Some(RequestKind::ScoDisconnect) {
        let result = if status == HCI_SUCCESS {
            Ok(())
        } else {
            Err(CmError::ControllerFailure(status))
        };
        cm.send_event(CmEvent::ScoDisconnectCfm {
            app,
            conn_id,
            handle,
            result,
        });
        cm.complete_and_restore(SubsystemClass::DeviceManager);
    }
}

pub(crate) fn sync_disconnect_ind(cm: &mut CmContext, handle: ScoHandle, reason: HciStatus) {
    cm.pcm.release_handle(handle);

    let Some(id) = find_element_by_sco_handle(cm, handle) else {
        warn!("sync disconnect indication for unknown handle 0x{:04X}", handle);
        return;
    };

    let (app, conn_id, slot) = {
        let Some(conn) = cm.rfc.conn(id) else { return };
        let slot = conn.sco.as_ref().and_then(|s| s.pcm_slot);
        (conn.app, conn.conn_id.unwrap_or_default(), slot)
    };

    if let Some(slot) = slot {
        cm.pcm.release_index(slot);
    }
    if let Some(conn) = cm.rfc.conn_mut(id) {
        conn.sco = None;
    }

    cm.send_event(CmEvent::ScoDisconnectInd {
        app,
        conn_id,
        handle,
        reason,
    });
}
