//! Tests for the RFCOMM engine.

use crate::context::CmContext;
use crate::controller::{
    ControllerCommand, ControllerEvent, HCI_ERROR_PAGE_TIMEOUT, HCI_SUCCESS,
};
use crate::dispatch::Request;
use crate::error::CmError;
use crate::events::CmEvent;
use crate::testutil::{addr, app, drain_commands, drain_events, open_acl, rfc_connect};

fn accept(cm: &mut CmContext, app_id: u16, channel: u8, context: u16) {
    cm.handle_request(Request::RfcConnectAccept {
        app: app(app_id),
        server_channel: channel,
        context,
        accept_timeout: None,
        class_of_device: 0,
    });
}

#[test]
fn test_register_roundtrip() {
    let mut cm = CmContext::new();
    cm.handle_request(Request::RfcRegister {
        app: app(1),
        server_channel: 3,
        context: 11,
    });
    assert!(cm.sm.serializer.is_locked());

    let commands = drain_commands(&mut cm);
    assert!(matches!(
        commands[0],
        ControllerCommand::RfcRegister { server_channel: 3 }
    ));

    cm.handle_controller_event(ControllerEvent::RfcRegisterCfm {
        server_channel: 3,
        success: true,
    });
    assert!(!cm.sm.serializer.is_locked());

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcRegisterCfm { server_channel: 3, context: 11, result: Ok(()), .. }
    )));
}

#[test]
fn test_connect_failure_frees_element() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    cm.handle_request(Request::RfcConnect {
        app: app(1),
        addr: addr(1),
        server_channel: 5,
        context: 0,
        class_of_device: 0,
        max_frame_size: 672,
    });
    cm.handle_controller_event(ControllerEvent::RfcConnectCfm {
        addr: addr(1),
        server_channel: 5,
        conn_id: 0x42,
        status: HCI_ERROR_PAGE_TIMEOUT,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcConnectCfm {
            result: Err(CmError::ControllerFailure(HCI_ERROR_PAGE_TIMEOUT)),
            ..
        }
    )));
    assert!(!cm.sm.serializer.is_locked());
    // House cleaning ran as part of the restore.
    assert!(cm.rfc.elements.is_empty());
}

#[test]
fn test_accept_duplicate_rejected_first_stays_pending() {
    let mut cm = CmContext::new();

    accept(&mut cm, 1, 3, 7);
    let events = drain_events(&mut cm);
    // No confirmation yet: the registration is pending.
    assert!(events.is_empty());

    accept(&mut cm, 1, 3, 7);
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcConnectAcceptCfm { result: Err(CmError::AlreadyConnecting), .. }
    )));

    // The first registration is still armed.
    assert!(cm.rfc.find_accept(3, 7).is_some());
    assert_eq!(
        cm.rfc
            .elements
            .iter()
            .filter(|e| e.conn.is_some())
            .count(),
        1
    );
}

#[test]
fn test_accept_same_channel_other_context_allowed() {
    let mut cm = CmContext::new();
    accept(&mut cm, 1, 3, 7);
    accept(&mut cm, 1, 3, 8);
    let events = drain_events(&mut cm);
    assert!(events.is_empty());
    assert!(cm.rfc.find_accept(3, 7).is_some());
    assert!(cm.rfc.find_accept(3, 8).is_some());
}

#[test]
fn test_incoming_connect_completes_registration() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    accept(&mut cm, 1, 3, 7);

    cm.handle_controller_event(ControllerEvent::RfcConnectInd {
        addr: addr(1),
        server_channel: 3,
        conn_id: 0x77,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::RfcConnectResponse { accept: true, .. }
    )));

    cm.handle_controller_event(ControllerEvent::RfcConnectCompleteInd {
        conn_id: 0x77,
        status: HCI_SUCCESS,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcConnectAcceptCfm { conn_id: Some(0x77), context: 7, result: Ok(()), .. }
    )));

    // The registration is consumed; the same pair may register again.
    assert!(cm.rfc.find_accept(3, 7).is_none());
}

#[test]
fn test_incoming_connect_unregistered_channel_rejected() {
    let mut cm = CmContext::new();
    cm.handle_controller_event(ControllerEvent::RfcConnectInd {
        addr: addr(1),
        server_channel: 9,
        conn_id: 0x10,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::RfcConnectResponse { accept: false, .. }
    )));
}

#[test]
fn test_cancel_accept_live_registration() {
    let mut cm = CmContext::new();
    accept(&mut cm, 1, 3, 7);

    cm.handle_request(Request::RfcCancelConnectAccept {
        app: app(1),
        server_channel: 3,
        context: 7,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcCancelAcceptCfm { result: Ok(()), .. }
    )));
    assert!(cm.rfc.find_accept(3, 7).is_none());
}

#[test]
fn test_cancel_accept_removes_queued_registration() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    // Occupy the service queue with a connect that has no confirmation
    // yet, so the accept parks in the save queue.
    cm.handle_request(Request::RfcConnect {
        app: app(9),
        addr: addr(1),
        server_channel: 5,
        context: 0,
        class_of_device: 0,
        max_frame_size: 672,
    });
    accept(&mut cm, 1, 3, 7);
    assert_eq!(cm.sm.serializer.queued(), 1);

    cm.handle_request(Request::RfcCancelConnectAccept {
        app: app(1),
        server_channel: 3,
        context: 7,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcCancelAcceptCfm { result: Ok(()), .. }
    )));
    assert_eq!(cm.sm.serializer.queued(), 0);
}

#[test]
fn test_cancel_accept_nothing_to_cancel() {
    let mut cm = CmContext::new();
    cm.handle_request(Request::RfcCancelConnectAccept {
        app: app(1),
        server_channel: 3,
        context: 7,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcCancelAcceptCfm { result: Err(CmError::UnknownConnection), .. }
    )));
}

#[test]
fn test_accept_timeout_expires_registration() {
    let mut cm = CmContext::new();
    accept(&mut cm, 1, 3, 7);

    cm.handle_request(Request::RfcAcceptTimeout {
        server_channel: 3,
        context: 7,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcConnectAcceptCfm { result: Err(CmError::Cancelled), .. }
    )));
    assert!(cm.rfc.find_accept(3, 7).is_none());
}

#[test]
fn test_release_roundtrip() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 5);

    cm.handle_request(Request::RfcDisconnect {
        app: app(1),
        conn_id,
        context: 0,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::RfcRelease { .. })));

    cm.handle_controller_event(ControllerEvent::RfcReleaseCfm {
        conn_id,
        status: HCI_SUCCESS,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::RfcDisconnectCfm { result: Ok(()), .. }
    )));
    assert!(!cm.sm.serializer.is_locked());
    assert!(cm.rfc.elements.is_empty());
}

#[test]
fn test_element_ids_unique_across_protocols() {
    let mut cm = CmContext::new();
    accept(&mut cm, 1, 3, 0);
    accept(&mut cm, 1, 4, 0);
    cm.handle_request(Request::L2capRegister {
        app: app(1),
        psm: crate::l2cap::Psm(0x1001),
        context: 0,
    });
    cm.handle_controller_event(ControllerEvent::L2capRegisterCfm {
        psm: crate::l2cap::Psm(0x1001),
        success: true,
    });
    cm.handle_request(Request::L2capConnectAccept {
        app: app(1),
        psm: crate::l2cap::Psm(0x1001),
        context: 0,
        class_of_device: 0,
    });

    let mut ids: Vec<u8> = cm
        .rfc
        .elements
        .iter()
        .map(|e| e.id.0)
        .chain(cm.l2cap.elements.iter().map(|e| e.id.0))
        .collect();
    let before = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), before);
    assert_eq!(before, 3);
}

#[test]
fn test_connect_while_busy_is_deferred_fifo() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    cm.handle_request(Request::RfcConnect {
        app: app(1),
        addr: addr(1),
        server_channel: 5,
        context: 0,
        class_of_device: 0,
        max_frame_size: 672,
    });
    cm.handle_request(Request::RfcConnect {
        app: app(2),
        addr: addr(1),
        server_channel: 6,
        context: 0,
        class_of_device: 0,
        max_frame_size: 672,
    });

    // One command out, one request parked.
    let commands = drain_commands(&mut cm);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, ControllerCommand::RfcConnect { .. }))
            .count(),
        1
    );
    assert_eq!(cm.sm.serializer.queued(), 1);

    cm.handle_controller_event(ControllerEvent::RfcConnectCfm {
        addr: addr(1),
        server_channel: 5,
        conn_id: 0x41,
        status: HCI_SUCCESS,
    });

    // Restore dispatched the second connect.
    assert!(cm.sm.serializer.is_locked());
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::RfcConnect { server_channel: 6, .. }
    )));
}
