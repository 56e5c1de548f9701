//! Tests for the L2CAP engine.

use crate::context::CmContext;
use crate::controller::{
    ControllerCommand, ControllerEvent, HCI_ERROR_CONNECTION_TIMEOUT, HCI_SUCCESS,
};
use crate::dispatch::Request;
use crate::error::CmError;
use crate::events::CmEvent;
use crate::l2cap::{L2capState, Psm};
use crate::testutil::{addr, app, drain_commands, drain_events, open_acl};

const PSM: Psm = Psm(0x1001);

fn register(cm: &mut CmContext, app_id: u16) {
    cm.handle_request(Request::L2capRegister {
        app: app(app_id),
        psm: PSM,
        context: 0,
    });
    cm.handle_controller_event(ControllerEvent::L2capRegisterCfm {
        psm: PSM,
        success: true,
    });
    drain_commands(cm);
    drain_events(cm);
}

fn connect(cm: &mut CmContext, app_id: u16, n: u8, conn_id: u32) {
    cm.handle_request(Request::L2capConnect {
        app: app(app_id),
        addr: addr(n),
        psm: PSM,
        remote_psm: PSM,
        context: 0,
        class_of_device: 0,
    });
    cm.handle_controller_event(ControllerEvent::L2capConnectCfm {
        addr: addr(n),
        psm: PSM,
        conn_id,
        status: HCI_SUCCESS,
    });
    drain_commands(cm);
    drain_events(cm);
}

#[test]
fn test_register_invalid_psm_rejected() {
    let mut cm = CmContext::new();
    cm.handle_request(Request::L2capRegister {
        app: app(1),
        psm: Psm(0x1002),
        context: 0,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capRegisterCfm { result: Err(CmError::UnacceptableParameter), .. }
    )));
    assert!(!cm.sm.serializer.is_locked());
}

#[test]
fn test_register_duplicate_rejected() {
    let mut cm = CmContext::new();
    register(&mut cm, 1);
    cm.handle_request(Request::L2capRegister {
        app: app(2),
        psm: PSM,
        context: 0,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capRegisterCfm { result: Err(CmError::AlreadyConnecting), .. }
    )));
}

#[test]
fn test_unregister_pairs_through_pending_queue() {
    let mut cm = CmContext::new();
    register(&mut cm, 1);

    cm.handle_request(Request::L2capUnregister {
        app: app(1),
        psm: PSM,
    });
    // Bypass path: the service queue is untouched.
    assert!(!cm.sm.serializer.is_locked());
    let commands = drain_commands(&mut cm);
    assert!(commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::L2capUnregister { .. })));

    cm.handle_controller_event(ControllerEvent::L2capUnregisterCfm {
        psm: PSM,
        status: HCI_SUCCESS,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capUnregisterCfm { result: Ok(()), .. }
    )));
    assert!(cm.l2cap.registration(PSM).is_none());
}

#[test]
fn test_unregister_unknown_psm() {
    let mut cm = CmContext::new();
    cm.handle_request(Request::L2capUnregister {
        app: app(1),
        psm: PSM,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capUnregisterCfm { result: Err(CmError::UnknownConnection), .. }
    )));
}

#[test]
fn test_connect_fills_extended_features_cache() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    cm.handle_request(Request::L2capConnect {
        app: app(1),
        addr: addr(1),
        psm: PSM,
        remote_psm: PSM,
        context: 0,
        class_of_device: 0,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::L2capGetInfo { .. })));

    cm.handle_controller_event(ControllerEvent::L2capGetInfoCfm {
        addr: addr(1),
        status: HCI_SUCCESS,
        extended_features: 0x0000_02A8,
    });
    assert_eq!(
        cm.acl_table().find(&addr(1)).unwrap().extended_features,
        Some(0x0000_02A8)
    );

    cm.handle_controller_event(ControllerEvent::L2capConnectCfm {
        addr: addr(1),
        psm: PSM,
        conn_id: 0x51,
        status: HCI_SUCCESS,
    });
    drain_events(&mut cm);

    // Cache warm: a second connect issues no further query.
    cm.handle_request(Request::L2capConnect {
        app: app(1),
        addr: addr(1),
        psm: PSM,
        remote_psm: PSM,
        context: 1,
        class_of_device: 0,
    });
    let commands = drain_commands(&mut cm);
    assert!(!commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::L2capGetInfo { .. })));
}

#[test]
fn test_accept_duplicate_rejected() {
    let mut cm = CmContext::new();
    register(&mut cm, 1);

    cm.handle_request(Request::L2capConnectAccept {
        app: app(1),
        psm: PSM,
        context: 4,
        class_of_device: 0,
    });
    assert!(drain_events(&mut cm).is_empty());

    cm.handle_request(Request::L2capConnectAccept {
        app: app(1),
        psm: PSM,
        context: 4,
        class_of_device: 0,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capConnectAcceptCfm { result: Err(CmError::AlreadyConnecting), .. }
    )));
    assert!(cm.l2cap.find_accept(PSM, 4).is_some());
}

#[test]
fn test_accept_requires_registration() {
    let mut cm = CmContext::new();
    cm.handle_request(Request::L2capConnectAccept {
        app: app(1),
        psm: PSM,
        context: 0,
        class_of_device: 0,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capConnectAcceptCfm { result: Err(CmError::UnknownConnection), .. }
    )));
}

#[test]
fn test_incoming_connect_and_complete() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    register(&mut cm, 1);
    cm.handle_request(Request::L2capConnectAccept {
        app: app(1),
        psm: PSM,
        context: 4,
        class_of_device: 0,
    });

    cm.handle_controller_event(ControllerEvent::L2capConnectInd {
        addr: addr(1),
        psm: PSM,
        conn_id: 0x90,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::L2capConnectResponse { accept: true, .. }
    )));

    cm.handle_controller_event(ControllerEvent::L2capConnectCompleteInd {
        conn_id: 0x90,
        status: HCI_SUCCESS,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capConnectAcceptCfm { conn_id: Some(0x90), result: Ok(()), .. }
    )));
}

#[test]
fn test_acl_close_completes_stuck_connect() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    // Outgoing connect with no confirmation yet.
    cm.handle_request(Request::L2capConnect {
        app: app(1),
        addr: addr(1),
        psm: PSM,
        remote_psm: PSM,
        context: 0,
        class_of_device: 0,
    });
    assert!(cm.sm.serializer.is_locked());
    drain_commands(&mut cm);

    // The link dies before the channel indication arrives; the connect is
    // completed with the close reason and the queue freed.
    cm.handle_controller_event(ControllerEvent::AclClosedInd {
        addr: crate::testutil::taddr(1),
        reason: HCI_ERROR_CONNECTION_TIMEOUT,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capConnectCfm {
            result: Err(CmError::ControllerFailure(HCI_ERROR_CONNECTION_TIMEOUT)),
            ..
        }
    )));
    assert!(!cm.sm.serializer.is_locked());
}

#[test]
fn test_disconnect_roundtrip() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    register(&mut cm, 1);
    connect(&mut cm, 1, 1, 0x51);

    cm.handle_request(Request::L2capDisconnect {
        app: app(1),
        conn_id: 0x51,
        context: 0,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::L2capDisconnect { .. })));

    cm.handle_controller_event(ControllerEvent::L2capDisconnectCfm {
        conn_id: 0x51,
        status: HCI_SUCCESS,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capDisconnectCfm { result: Ok(()), .. }
    )));
    assert!(!cm.sm.serializer.is_locked());
    assert!(cm.l2cap.elements.is_empty());
}

#[test]
fn test_remote_disconnect_ind_cleans_up() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    register(&mut cm, 1);
    connect(&mut cm, 1, 1, 0x51);
    assert_eq!(cm.count_connections_to_peer(&addr(1)), 1);

    cm.handle_controller_event(ControllerEvent::L2capDisconnectInd {
        conn_id: 0x51,
        reason: HCI_ERROR_CONNECTION_TIMEOUT,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::L2capDisconnectInd { conn_id: 0x51, .. }
    )));
    assert_eq!(cm.count_connections_to_peer(&addr(1)), 0);
    assert!(cm.l2cap.elements.is_empty());
}

#[test]
fn test_states_progress_on_outgoing_connect() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    cm.handle_request(Request::L2capConnect {
        app: app(1),
        addr: addr(1),
        psm: PSM,
        remote_psm: PSM,
        context: 0,
        class_of_device: 0,
    });

    let id = cm.l2cap.active_element.unwrap();
    assert_eq!(cm.l2cap.conn(id).unwrap().state, L2capState::ConnectInit);

    cm.handle_controller_event(ControllerEvent::L2capConnectCfm {
        addr: addr(1),
        psm: PSM,
        conn_id: 0x51,
        status: HCI_SUCCESS,
    });
    let element = cm.l2cap.find_by_conn_id(0x51).unwrap();
    assert_eq!(element.conn.as_ref().unwrap().state, L2capState::Connected);
}
