//! Shared helpers for the module tests: drive a context through common
//! request/confirmation exchanges and drain its queues.

use crate::context::CmContext;
use crate::controller::{ControllerCommand, ControllerEvent, HCI_SUCCESS};
use crate::dispatch::Request;
use crate::events::CmEvent;
use crate::types::{AppHandle, BdAddr, ConnId, ServerChannel, TypedAddr};

/// Routes `log` output into the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn addr(n: u8) -> BdAddr {
    BdAddr::new([n, 0x22, 0x33, 0x44, 0x55, 0x66])
}

pub fn taddr(n: u8) -> TypedAddr {
    TypedAddr::public(addr(n))
}

pub fn app(n: u16) -> AppHandle {
    AppHandle(n)
}

pub fn drain_commands(cm: &mut CmContext) -> Vec<ControllerCommand> {
    let mut out = Vec::new();
    while let Some(cmd) = cm.take_command() {
        out.push(cmd);
    }
    out
}

pub fn drain_events(cm: &mut CmContext) -> Vec<CmEvent> {
    let mut out = Vec::new();
    while let Some(event) = cm.take_event() {
        out.push(event);
    }
    out
}

/// Brings up an ACL to `addr(n)` as the controller would report it,
/// completes the post-open read sequence, and clears the traffic from the
/// queues.
pub fn open_acl(cm: &mut CmContext, n: u8) {
    init_logging();
    cm.handle_controller_event(ControllerEvent::AclOpenedInd {
        addr: taddr(n),
        incoming: false,
        class_of_device: 0x00_1F00,
        status: HCI_SUCCESS,
    });
    cm.handle_controller_event(ControllerEvent::RemoteFeaturesCfm {
        addr: addr(n),
        status: HCI_SUCCESS,
        features: [0xFF; 8],
    });
    cm.handle_controller_event(ControllerEvent::RemoteVersionCfm {
        addr: addr(n),
        status: HCI_SUCCESS,
        lmp_version: 8,
        manufacturer: 0x000A,
        lmp_subversion: 0x0100,
    });
    cm.handle_controller_event(ControllerEvent::RoleDiscoveryCfm {
        addr: addr(n),
        status: HCI_SUCCESS,
        role: crate::types::Role::Master,
    });
    drain_commands(cm);
    drain_events(cm);
}

/// Runs a full outgoing RFCOMM connect for `app_id` and returns the
/// connection id the fake controller assigned.
pub fn rfc_connect(cm: &mut CmContext, app_id: u16, n: u8, channel: ServerChannel) -> ConnId {
    let conn_id: ConnId = 0x0100 + u32::from(channel);
    cm.handle_request(Request::RfcConnect {
        app: app(app_id),
        addr: addr(n),
        server_channel: channel,
        context: 0,
        class_of_device: 0,
        max_frame_size: 672,
    });
    cm.handle_controller_event(ControllerEvent::RfcConnectCfm {
        addr: addr(n),
        server_channel: channel,
        conn_id,
        status: HCI_SUCCESS,
    });
    drain_commands(cm);
    drain_events(cm);
    conn_id
}
