//! Tests for the SCO/eSCO negotiation engine.

use crate::context::CmContext;
use crate::controller::{
    ControllerCommand, ControllerEvent, SyncLinkType, HCI_ERROR_UNACCEPTABLE_PARAMETERS,
    HCI_SUCCESS,
};
use crate::dispatch::Request;
use crate::error::CmError;
use crate::events::CmEvent;
use crate::sco::constants::{SyncPacketType, EDR_ESCO_PACKETS, SCO_PACKETS};
use crate::sco::{NegotiationCursor, SyncNegotiatedParams, SyncParams};
use crate::testutil::{addr, app, drain_commands, drain_events, open_acl, rfc_connect};
use crate::types::EncryptionType;

const ALL_FEATURES: [u8; 8] = [0xFF; 8];

/// Remote supporting only EV3 and the SCO packets (no EDR eSCO, no
/// EV4/EV5).
fn legacy_features() -> [u8; 8] {
    let mut features = [0u8; 8];
    features[1] |= 0x08 | 0x10 | 0x20; // SCO link, HV2, HV3
    features[3] |= 0x80; // EV3
    features
}

fn request_all() -> SyncParams {
    SyncParams {
        packet_types: SCO_PACKETS | SyncPacketType::EV3 | SyncPacketType::EV4 | SyncPacketType::EV5,
        ..SyncParams::default_esco()
    }
}

fn negotiated() -> SyncNegotiatedParams {
    SyncNegotiatedParams {
        tx_interval: 12,
        retransmission_window: 2,
        rx_packet_length: 60,
        tx_packet_length: 60,
        air_mode: 0x02,
    }
}

#[test]
fn test_candidate_order_prefers_edr() {
    let cursor = NegotiationCursor::build(
        &[request_all()],
        &ALL_FEATURES,
        &ALL_FEATURES,
        EncryptionType::None,
    );
    // Everything requested and supported: first candidate is 3-slot EDR
    // (exclusion mask clearing only NO_3EV5).
    let first = cursor.current().unwrap();
    assert_eq!(
        first.packet_types,
        EDR_ESCO_PACKETS - SyncPacketType::NO_3EV5
    );
    assert!(!first.packet_types.is_sco());
}

#[test]
fn test_feature_filter_limits_candidates() {
    let mut cursor = NegotiationCursor::build(
        &[request_all()],
        &ALL_FEATURES,
        &legacy_features(),
        EncryptionType::None,
    );

    // No EDR candidates possible; best is EV3, then the SCO packets.
    let first = cursor.current().unwrap();
    assert_eq!(
        first.packet_types,
        SyncPacketType::EV3 | EDR_ESCO_PACKETS
    );

    let mut seen = 1;
    while cursor.advance().is_some() {
        seen += 1;
    }
    // EV3, HV3, HV2, HV1.
    assert_eq!(seen, 4);
}

#[test]
fn test_aes_ccm_forbids_legacy_sco() {
    let mut cursor = NegotiationCursor::build(
        &[request_all()],
        &ALL_FEATURES,
        &legacy_features(),
        EncryptionType::AesCcm,
    );

    loop {
        let params = match cursor.current() {
            Some(p) => p,
            None => break,
        };
        assert!(!params.packet_types.is_sco());
        if cursor.advance().is_none() {
            break;
        }
    }
}

#[test]
fn test_empty_sets_dropped_and_termination() {
    // Second set requests nothing usable and must be dropped entirely.
    let nothing = SyncParams {
        packet_types: SyncPacketType::empty(),
        ..SyncParams::default_esco()
    };
    let mut cursor = NegotiationCursor::build(
        &[request_all(), nothing, request_all()],
        &ALL_FEATURES,
        &ALL_FEATURES,
        EncryptionType::None,
    );

    let mut rounds = 0;
    while cursor.current().is_some() {
        rounds += 1;
        assert!(rounds < 64, "cursor must terminate");
        if cursor.advance().is_none() {
            break;
        }
    }
    assert!(rounds > 0);
    // Exhausted for good.
    assert!(cursor.advance().is_none());
}

#[test]
fn test_seek_sco_only() {
    let mut cursor = NegotiationCursor::build(
        &[request_all()],
        &ALL_FEATURES,
        &ALL_FEATURES,
        EncryptionType::None,
    );
    let params = cursor.seek_sco_only().unwrap();
    assert!(params.packet_types.is_sco());

    // A request without SCO packets can never satisfy the seek.
    let esco_only = SyncParams {
        packet_types: SyncPacketType::EV3,
        ..SyncParams::default_esco()
    };
    let mut cursor = NegotiationCursor::build(
        &[esco_only],
        &ALL_FEATURES,
        &ALL_FEATURES,
        EncryptionType::None,
    );
    assert!(cursor.seek_sco_only().is_none());
}

#[test]
fn test_outgoing_negotiation_walks_candidates() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    cm.handle_request(Request::ScoConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    assert!(cm.dm.serializer.is_locked());
    let commands = drain_commands(&mut cm);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, ControllerCommand::SyncConnect { .. }))
            .count(),
        1
    );

    // First round rejected: the engine retries with the next candidate
    // without giving up the queue.
    cm.handle_controller_event(ControllerEvent::SyncConnectCfm {
        addr: addr(1),
        handle: 0,
        status: HCI_ERROR_UNACCEPTABLE_PARAMETERS,
        negotiated: None,
    });
    assert!(cm.dm.serializer.is_locked());
    let commands = drain_commands(&mut cm);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, ControllerCommand::SyncConnect { .. }))
            .count(),
        1
    );

    // Second round succeeds.
    cm.handle_controller_event(ControllerEvent::SyncConnectCfm {
        addr: addr(1),
        handle: 0x33,
        status: HCI_SUCCESS,
        negotiated: Some(negotiated()),
    });
    assert!(!cm.dm.serializer.is_locked());
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoConnectCfm { handle: Some(0x33), result: Ok(()), .. }
    )));
    assert_eq!(cm.pcm.find(0x33), Some(0));
}

#[test]
fn test_outgoing_negotiation_exhaustion_rejects() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    // A single HV1-only set keeps the walk short.
    let hv1_only = SyncParams {
        packet_types: SyncPacketType::HV1,
        ..SyncParams::default_esco()
    };
    cm.handle_request(Request::ScoConnect {
        app: app(1),
        conn_id,
        params: vec![hv1_only],
    });
    drain_commands(&mut cm);

    cm.handle_controller_event(ControllerEvent::SyncConnectCfm {
        addr: addr(1),
        handle: 0,
        status: HCI_ERROR_UNACCEPTABLE_PARAMETERS,
        negotiated: None,
    });

    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoConnectCfm {
            result: Err(CmError::ControllerFailure(HCI_ERROR_UNACCEPTABLE_PARAMETERS)),
            ..
        }
    )));
    assert!(!cm.dm.serializer.is_locked());
    // The reserved audio slot went back.
    assert_eq!(cm.pcm.in_use(), 0);
}

#[test]
fn test_unsupported_request_rejected_before_controller() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    let nothing = SyncParams {
        packet_types: SyncPacketType::empty(),
        ..SyncParams::default_esco()
    };
    cm.handle_request(Request::ScoConnect {
        app: app(1),
        conn_id,
        params: vec![nothing],
    });

    let commands = drain_commands(&mut cm);
    assert!(!commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::SyncConnect { .. })));
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoConnectCfm { result: Err(CmError::UnsupportedFeature), .. }
    )));
    assert!(!cm.dm.serializer.is_locked());
}

#[test]
fn test_incoming_accept_flow() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    cm.handle_request(Request::ScoAcceptConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    // Arming completes the queue interaction at once.
    assert!(!cm.dm.serializer.is_locked());

    cm.handle_controller_event(ControllerEvent::SyncConnectInd {
        addr: addr(1),
        link_type: SyncLinkType::Esco,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::SyncConnectResponse { params: Some(_), .. }
    )));

    cm.handle_controller_event(ControllerEvent::SyncConnectCompleteInd {
        addr: addr(1),
        handle: 0x44,
        status: HCI_SUCCESS,
        negotiated: Some(negotiated()),
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoAcceptConnectCfm { handle: Some(0x44), result: Ok(()), .. }
    )));
    assert_eq!(cm.pcm.find(0x44), Some(0));
}

#[test]
fn test_incoming_sco_link_answered_sco_only() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    cm.handle_request(Request::ScoAcceptConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    cm.handle_controller_event(ControllerEvent::SyncConnectInd {
        addr: addr(1),
        link_type: SyncLinkType::Sco,
    });

    let commands = drain_commands(&mut cm);
    let response = commands.iter().find_map(|c| match c {
        ControllerCommand::SyncConnectResponse { params, .. } => params.as_ref(),
        _ => None,
    });
    assert!(response.unwrap().packet_types.is_sco());
}

#[test]
fn test_incoming_without_acceptor_rejected() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);

    cm.handle_controller_event(ControllerEvent::SyncConnectInd {
        addr: addr(1),
        link_type: SyncLinkType::Esco,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::SyncConnectResponse { params: None, .. }
    )));
}

#[test]
fn test_cancel_accept_during_setup_synthesizes_teardown() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    cm.handle_request(Request::ScoAcceptConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    cm.handle_controller_event(ControllerEvent::SyncConnectInd {
        addr: addr(1),
        link_type: SyncLinkType::Esco,
    });
    drain_commands(&mut cm);

    // Cancel lands while the controller is completing the setup.
    cm.handle_request(Request::ScoCancelAcceptConnect {
        app: app(1),
        conn_id,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoCancelAcceptCfm { result: Ok(()), .. }
    )));

    cm.handle_controller_event(ControllerEvent::SyncConnectCompleteInd {
        addr: addr(1),
        handle: 0x55,
        status: HCI_SUCCESS,
        negotiated: Some(negotiated()),
    });

    // The link that nobody wants is taken straight back down, and no
    // accept confirmation is delivered.
    let commands = drain_commands(&mut cm);
    assert!(commands.iter().any(|c| matches!(
        c,
        ControllerCommand::SyncDisconnect { handle: 0x55, .. }
    )));
    let events = drain_events(&mut cm);
    assert!(!events
        .iter()
        .any(|e| matches!(e, CmEvent::ScoAcceptConnectCfm { .. })));
}

#[test]
fn test_release_defers_behind_sco_teardown() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    // Establish an eSCO child link.
    cm.handle_request(Request::ScoConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    drain_commands(&mut cm);
    cm.handle_controller_event(ControllerEvent::SyncConnectCfm {
        addr: addr(1),
        handle: 0x66,
        status: HCI_SUCCESS,
        negotiated: Some(negotiated()),
    });
    drain_events(&mut cm);

    // Release: the channel must not go down while the child link lives.
    cm.handle_request(Request::RfcDisconnect {
        app: app(1),
        conn_id,
        context: 0,
    });
    let commands = drain_commands(&mut cm);
    assert!(commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::SyncDisconnect { handle: 0x66, .. })));
    assert!(!commands
        .iter()
        .any(|c| matches!(c, ControllerCommand::RfcRelease { .. })));

    cm.handle_controller_event(ControllerEvent::SyncDisconnectCfm {
        handle: 0x66,
        status: HCI_SUCCESS,
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
    assert_eq!(cm.pcm.in_use(), 0);
}

#[test]
fn test_remote_sco_disconnect_ind() {
    let mut cm = CmContext::new();
    open_acl(&mut cm, 1);
    let conn_id = rfc_connect(&mut cm, 1, 1, 3);

    cm.handle_request(Request::ScoConnect {
        app: app(1),
        conn_id,
        params: vec![request_all()],
    });
    drain_commands(&mut cm);
    cm.handle_controller_event(ControllerEvent::SyncConnectCfm {
        addr: addr(1),
        handle: 0x77,
        status: HCI_SUCCESS,
        negotiated: Some(negotiated()),
    });
    drain_events(&mut cm);

    cm.handle_controller_event(ControllerEvent::SyncDisconnectInd {
        handle: 0x77,
        reason: 0x08,
    });
    let events = drain_events(&mut cm);
    assert!(events.iter().any(|e| matches!(
        e,
        CmEvent::ScoDisconnectInd { handle: 0x77, reason: 0x08, .. }
    )));
    assert_eq!(cm.pcm.in_use(), 0);
}
