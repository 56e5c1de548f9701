//! RFCOMM connection instance types.

use crate::sco::{SyncNegotiatedParams, SyncParams};
use crate::types::{AppHandle, BdAddr, ClassOfDevice, ConnId, ElementId, ScoHandle, ServerChannel};

/// State of one RFCOMM channel instance. Transitions are driven only by
/// controller confirmations/indications and by application requests routed
/// through the service-manager serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RfcState {
    #[default]
    Idle,
    /// Accept registration armed, waiting for an incoming connection.
    Connectable,
    /// Outgoing connect issued, waiting for the controller.
    ConnectInit,
    /// Outgoing connect progressing (channel-level setup).
    Connect,
    /// Incoming connection being accepted.
    ConnectAccept,
    /// Incoming connection accepted, waiting for completion.
    ConnectAcceptFinal,
    Connected,
    /// Release issued (or deferred behind a SCO teardown).
    Release,
    /// Accept registration being cancelled.
    CancelConnectable,
    /// Outgoing connect being cancelled.
    CancelConnecting,
}

/// SCO/eSCO link associated with an RFCOMM channel.
#[derive(Debug, Clone, Default)]
pub struct ScoLink {
    /// Established link handle; `None` while armed or negotiating.
    pub handle: Option<ScoHandle>,
    /// Registered to accept an incoming synchronous connection.
    pub accept_armed: bool,
    /// Parameter sets armed for accepting.
    pub accept_params: Vec<SyncParams>,
    /// A disconnect has been issued, or a cancel arrived mid-setup.
    pub close_pending: bool,
    /// The owning channel's release is deferred until this link is down.
    pub release_after_disconnect: bool,
    /// Reserved hardware audio time-slot.
    pub pcm_slot: Option<usize>,
    pub negotiated: Option<SyncNegotiatedParams>,
}

/// One RFCOMM channel instance.
#[derive(Debug, Clone)]
pub struct RfcConnection {
    pub app: AppHandle,
    pub addr: BdAddr,
    /// Local server channel (meaningful for accept registrations).
    pub server_channel: ServerChannel,
    /// Remote server channel (meaningful for outgoing connects).
    pub remote_server_channel: ServerChannel,
    pub context: u16,
    pub conn_id: Option<ConnId>,
    pub state: RfcState,
    pub class_of_device: ClassOfDevice,
    pub max_frame_size: u16,
    pub sco: Option<ScoLink>,
    /// Accept registrations may auto-cancel after this many seconds.
    pub accept_timeout: Option<u16>,
    pub security_registered: bool,
}

impl RfcConnection {
    pub fn is_connected(&self) -> bool {
        self.state == RfcState::Connected
    }
}

/// List node owning a connection instance. The instance may be freed while
/// the element survives until the next house-cleaning pass, so an id is
/// never reused while anything might still reference it.
#[derive(Debug)]
pub struct RfcElement {
    pub id: ElementId,
    pub conn: Option<RfcConnection>,
}

/// RFCOMM engine state.
#[derive(Debug, Default)]
pub struct RfcVariables {
    pub elements: Vec<RfcElement>,
    /// Element the in-flight outgoing connect belongs to.
    pub active_element: Option<ElementId>,
    /// The in-flight outgoing connect is being cancelled.
    pub cancel_connect: bool,
}

impl RfcVariables {
    pub fn element(&self, id: ElementId) -> Option<&RfcElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut RfcElement> {
        self.elements.iter_mut().find(|e| e.id == id)
    }

    pub fn conn(&self, id: ElementId) -> Option<&RfcConnection> {
        self.element(id).and_then(|e| e.conn.as_ref())
    }

    pub fn conn_mut(&mut self, id: ElementId) -> Option<&mut RfcConnection> {
        self.element_mut(id).and_then(|e| e.conn.as_mut())
    }

    /// Element owning the given established connection id.
    pub fn find_by_conn_id(&self, conn_id: ConnId) -> Option<&RfcElement> {
        self.elements.iter().find(|e| {
            e.conn
                .as_ref()
                .is_some_and(|c| c.conn_id == Some(conn_id))
        })
    }

    /// Live accept registration for (server channel, context), any state
    /// that still counts as outstanding.
    pub fn find_accept(&self, server_channel: ServerChannel, context: u16) -> Option<&RfcElement> {
        self.elements.iter().find(|e| {
            e.conn.as_ref().is_some_and(|c| {
                c.server_channel == server_channel
                    && c.context == context
                    && matches!(
                        c.state,
                        RfcState::Connectable
                            | RfcState::ConnectAccept
                            | RfcState::ConnectAcceptFinal
                            | RfcState::CancelConnectable
                    )
            })
        })
    }

    /// First armed registration for an incoming connection on the channel.
    pub fn find_connectable(&self, server_channel: ServerChannel) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|e| {
                e.conn.as_ref().is_some_and(|c| {
                    c.server_channel == server_channel && c.state == RfcState::Connectable
                })
            })
            .map(|e| e.id)
    }

    /// Drops elements whose instance is gone and forgets the active id.
    /// Runs as part of every service-manager restore.
    pub fn purge_unused(&mut self) {
        self.elements.retain(|e| e.conn.is_some());
        self.active_element = None;
    }
}
