//! Inquiry handling and the discovery serializer's restart condition.
//!
//! Discovery owns its own serializer instance: an inquiry holds the radio
//! in a way that fights paging, so an outgoing connection setup pauses a
//! running inquiry and the empty-queue resolution of a later restore
//! restarts it.

use log::debug;

use crate::context::CmContext;
use crate::controller::{ControllerCommand, HciStatus, HCI_SUCCESS};
use crate::dispatch::{RequestKind, SubsystemClass};
use crate::error::CmError;
use crate::events::CmEvent;
use crate::types::{AppHandle, BdAddr, ClassOfDevice};

/// General/unlimited inquiry access code.
pub const ACCESS_CODE_GIAC: u32 = 0x9E8B33;

/// Application-visible inquiry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InquiryAppState {
    #[default]
    Idle,
    Inquiring,
    /// An inquiry was interrupted (or requested) while the subsystem was
    /// busy; it restarts when the queues drain.
    Restarting,
}

/// Controller-side inquiry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InquiryDmState {
    #[default]
    Idle,
    Inquiring,
    Cancelling,
}

/// Stored inquiry parameters, reused on restart.
#[derive(Debug, Clone, Copy)]
pub struct InquiryParams {
    pub access_code: u32,
    pub timeout: u8,
    pub max_responses: u8,
}

impl Default for InquiryParams {
    fn default() -> Self {
        Self {
            access_code: ACCESS_CODE_GIAC,
            timeout: 10,
            max_responses: 0,
        }
    }
}

pub(crate) fn inquiry_req(
    cm: &mut CmContext,
    app: AppHandle,
    access_code: u32,
    timeout: u8,
    max_responses: u8,
) {
    cm.discovery.app = app;
    cm.discovery.params = InquiryParams {
        access_code,
        timeout,
        max_responses,
    };
    start_inquiry(cm);
}

/// Issues the inquiry command under the already-held discovery lock.
fn start_inquiry(cm: &mut CmContext) {
    cm.discovery.app_state = InquiryAppState::Inquiring;
    cm.discovery.dm_state = InquiryDmState::Inquiring;
    let params = cm.discovery.params;
    cm.send_command(ControllerCommand::Inquiry {
        access_code: params.access_code,
        timeout: params.timeout,
        max_responses: params.max_responses,
    });
}

/// Re-acquires the discovery lock and restarts an interrupted inquiry.
/// Called from the empty-queue resolution of `complete_and_restore`.
pub(crate) fn resolve_restart(cm: &mut CmContext) {
    if cm.discovery.app_state == InquiryAppState::Restarting
        && cm.discovery.dm_state == InquiryDmState::Idle
        && !cm.discovery.serializer.is_locked()
        && !cm.sm.serializer.is_locked()
    {
        debug!("restarting interrupted inquiry");
        cm.discovery.serializer.lock(RequestKind::Inquiry);
        start_inquiry(cm);
    }
}

/// An outgoing connection is about to page; a running inquiry must yield.
/// The inquiry is marked for restart and cancelled at the controller.
pub(crate) fn pause_for_paging(cm: &mut CmContext) {
    if cm.discovery.dm_state == InquiryDmState::Inquiring {
        debug!("pausing inquiry for paging");
        cm.discovery.app_state = InquiryAppState::Restarting;
        cm.discovery.dm_state = InquiryDmState::Cancelling;
        cm.send_command(ControllerCommand::InquiryCancel);
    }
}

pub(crate) fn cancel_inquiry_req(cm: &mut CmContext, app: AppHandle) {
    match cm.discovery.dm_state {
        InquiryDmState::Inquiring => {
            cm.discovery.app_state = InquiryAppState::Idle;
            cm.discovery.dm_state = InquiryDmState::Cancelling;
            cm.discovery.cancel_app = app;
            cm.send_command(ControllerCommand::InquiryCancel);
        }
        _ => {
            cm.send_event(CmEvent::InquiryCfm {
                app,
                result: Err(CmError::UnknownConnection),
            });
        }
    }
}

pub(crate) fn inquiry_result_ind(cm: &mut CmContext, addr: BdAddr, class_of_device: ClassOfDevice) {
    if cm.discovery.dm_state != InquiryDmState::Inquiring {
        return;
    }
    let app = cm.discovery.app;
    cm.send_event(CmEvent::InquiryResultInd {
        app,
        addr,
        class_of_device,
    });
}

pub(crate) fn inquiry_complete_ind(cm: &mut CmContext, status: HciStatus) {
    if cm.discovery.dm_state != InquiryDmState::Inquiring {
        // A cancel is in flight; its confirmation finishes the bookkeeping.
        return;
    }

    let app = cm.discovery.app;
    cm.discovery.dm_state = InquiryDmState::Idle;
    cm.discovery.app_state = InquiryAppState::Idle;

    let result = if status == HCI_SUCCESS {
        Ok(())
    } else {
        Err(CmError::ControllerFailure(status))
    };
    cm.send_event(CmEvent::InquiryCfm { app, result });

    if cm.discovery.serializer.lock_token() == Some(RequestKind::Inquiry) {
        cm.complete_and_restore(SubsystemClass::Discovery);
    }
}

pub(crate) fn inquiry_cancel_cfm(cm: &mut CmContext, _status: HciStatus) {
    if cm.discovery.dm_state != InquiryDmState::Cancelling {
        cm.general_exception("discovery", "unexpected inquiry cancel confirmation");
        return;
    }

    cm.discovery.dm_state = InquiryDmState::Idle;

    match cm.discovery.app_state {
        InquiryAppState::Restarting => {
            // Paused for paging; no application confirmation, the restart
            // condition fires once the queues drain. Release the lock the
            // interrupted inquiry held.
            if cm.discovery.serializer.lock_token() == Some(RequestKind::Inquiry) {
                cm.complete_and_restore(SubsystemClass::Discovery);
            }
        }
        _ => {
            let app = cm.discovery.cancel_app;
            cm.discovery.app_state = InquiryAppState::Idle;
            cm.send_event(CmEvent::InquiryCfm {
                app,
                result: Err(CmError::Cancelled),
            });
            if cm.discovery.serializer.lock_token() == Some(RequestKind::Inquiry) {
                cm.complete_and_restore(SubsystemClass::Discovery);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CmContext;
    use crate::controller::{ControllerCommand, ControllerEvent, HCI_SUCCESS};
    use crate::dispatch::Request;
    use crate::testutil::{addr, app, drain_commands, drain_events, open_acl};

    fn start(cm: &mut CmContext) {
        cm.handle_request(Request::Inquiry {
            app: app(1),
            access_code: ACCESS_CODE_GIAC,
            timeout: 10,
            max_responses: 0,
        });
    }

    #[test]
    fn test_inquiry_roundtrip() {
        let mut cm = CmContext::new();
        start(&mut cm);
        assert!(cm.discovery.serializer.is_locked());

        let commands = drain_commands(&mut cm);
        assert!(commands
            .iter()
            .any(|c| matches!(c, ControllerCommand::Inquiry { .. })));

        cm.handle_controller_event(ControllerEvent::InquiryResultInd {
            addr: addr(5),
            class_of_device: 0x00_0408,
        });
        cm.handle_controller_event(ControllerEvent::InquiryCompleteInd {
            status: HCI_SUCCESS,
        });

        let events = drain_events(&mut cm);
        assert!(events.iter().any(|e| matches!(
            e,
            CmEvent::InquiryResultInd { app: a, .. } if *a == app(1)
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, CmEvent::InquiryCfm { result: Ok(()), .. })));
        assert!(!cm.discovery.serializer.is_locked());
    }

    #[test]
    fn test_cancel_inquiry() {
        let mut cm = CmContext::new();
        start(&mut cm);
        drain_commands(&mut cm);

        cm.handle_request(Request::CancelInquiry { app: app(1) });
        let commands = drain_commands(&mut cm);
        assert!(commands
            .iter()
            .any(|c| matches!(c, ControllerCommand::InquiryCancel)));

        cm.handle_controller_event(ControllerEvent::InquiryCancelCfm {
            status: HCI_SUCCESS,
        });
        let events = drain_events(&mut cm);
        assert!(events.iter().any(|e| matches!(
            e,
            CmEvent::InquiryCfm { result: Err(crate::error::CmError::Cancelled), .. }
        )));
        assert!(!cm.discovery.serializer.is_locked());
        assert_eq!(cm.discovery.app_state, InquiryAppState::Idle);
    }

    #[test]
    fn test_connect_pauses_inquiry_and_restart_fires_on_drain() {
        let mut cm = CmContext::new();
        open_acl(&mut cm, 1);
        start(&mut cm);
        drain_commands(&mut cm);

        // An outgoing connection setup pauses the inquiry.
        cm.handle_request(Request::RfcConnect {
            app: app(2),
            addr: addr(1),
            server_channel: 5,
            context: 0,
            class_of_device: 0,
            max_frame_size: 672,
        });
        let commands = drain_commands(&mut cm);
        assert!(commands
            .iter()
            .any(|c| matches!(c, ControllerCommand::InquiryCancel)));
        assert_eq!(cm.discovery.app_state, InquiryAppState::Restarting);

        cm.handle_controller_event(ControllerEvent::InquiryCancelCfm {
            status: HCI_SUCCESS,
        });
        // Service setup still busy: no restart yet.
        assert!(drain_commands(&mut cm)
            .iter()
            .all(|c| !matches!(c, ControllerCommand::Inquiry { .. })));

        // The connect completes; the service queue drains empty and the
        // interrupted inquiry restarts.
        cm.handle_controller_event(ControllerEvent::RfcConnectCfm {
            addr: addr(1),
            server_channel: 5,
            conn_id: 0x21,
            status: HCI_SUCCESS,
        });
        let commands = drain_commands(&mut cm);
        assert!(commands
            .iter()
            .any(|c| matches!(c, ControllerCommand::Inquiry { .. })));
        assert_eq!(cm.discovery.app_state, InquiryAppState::Inquiring);
        assert!(cm.discovery.serializer.is_locked());
    }

    #[test]
    fn test_cancel_without_inquiry_rejected() {
        let mut cm = CmContext::new();
        cm.handle_request(Request::CancelInquiry { app: app(1) });
        let events = drain_events(&mut cm);
        assert!(events.iter().any(|e| matches!(
            e,
            CmEvent::InquiryCfm { result: Err(crate::error::CmError::UnknownConnection), .. }
        )));
    }
}
