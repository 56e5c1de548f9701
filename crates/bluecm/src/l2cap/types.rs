//! L2CAP connection instance types.

use std::fmt;

use crate::types::{AppHandle, BdAddr, ClassOfDevice, ConnId, ElementId};

/// Protocol/Service Multiplexer value.
///
/// Valid PSMs have an odd least-significant octet and an even
/// most-significant octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psm(pub u16);

impl Psm {
    pub const SDP: Psm = Psm(0x0001);
    pub const RFCOMM: Psm = Psm(0x0003);
    pub const BNEP: Psm = Psm(0x000F);

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0 && (self.0 & 0x0001) == 0x0001 && (self.0 & 0x0100) == 0
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// State of one L2CAP channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L2capState {
    #[default]
    Idle,
    Connectable,
    ConnectInit,
    Connect,
    ConnectAccept,
    ConnectAcceptFinal,
    Connected,
    Release,
    CancelConnectable,
    CancelConnecting,
}

/// A local PSM armed for incoming connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsmRegistration {
    pub psm: Psm,
    pub app: AppHandle,
    pub context: u16,
}

/// One L2CAP channel instance.
#[derive(Debug, Clone)]
pub struct L2capConnection {
    pub app: AppHandle,
    pub addr: BdAddr,
    pub psm: Psm,
    pub remote_psm: Psm,
    pub context: u16,
    pub conn_id: Option<ConnId>,
    pub state: L2capState,
    pub class_of_device: ClassOfDevice,
    pub outgoing_mtu: u16,
    pub incoming_mtu: u16,
    pub security_registered: bool,
}

impl L2capConnection {
    pub fn is_connected(&self) -> bool {
        self.state == L2capState::Connected
    }
}

/// List node owning a connection instance; see the RFCOMM counterpart for
/// the freeing discipline.
#[derive(Debug)]
pub struct L2capElement {
    pub id: ElementId,
    pub conn: Option<L2capConnection>,
}

/// L2CAP engine state.
#[derive(Debug, Default)]
pub struct L2capVariables {
    pub elements: Vec<L2capElement>,
    pub registrations: Vec<PsmRegistration>,
    pub active_element: Option<ElementId>,
    pub cancel_connect: bool,
}

impl L2capVariables {
    pub fn element(&self, id: ElementId) -> Option<&L2capElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut L2capElement> {
        self.elements.iter_mut().find(|e| e.id == id)
    }

    pub fn conn(&self, id: ElementId) -> Option<&L2capConnection> {
        self.element(id).and_then(|e| e.conn.as_ref())
    }

    pub fn conn_mut(&mut self, id: ElementId) -> Option<&mut L2capConnection> {
        self.element_mut(id).and_then(|e| e.conn.as_mut())
    }

    pub fn find_by_conn_id(&self, conn_id: ConnId) -> Option<&L2capElement> {
        self.elements.iter().find(|e| {
            e.conn
                .as_ref()
                .is_some_and(|c| c.conn_id == Some(conn_id))
        })
    }

    pub fn registration(&self, psm: Psm) -> Option<&PsmRegistration> {
        self.registrations.iter().find(|r| r.psm == psm)
    }

    /// Live accept registration for (PSM, context).
    pub fn find_accept(&self, psm: Psm, context: u16) -> Option<&L2capElement> {
        self.elements.iter().find(|e| {
            e.conn.as_ref().is_some_and(|c| {
                c.psm == psm
                    && c.context == context
                    && matches!(
                        c.state,
                        L2capState::Connectable
                            | L2capState::ConnectAccept
                            | L2capState::ConnectAcceptFinal
                            | L2capState::CancelConnectable
                    )
            })
        })
    }

    pub fn find_connectable(&self, psm: Psm) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|e| {
                e.conn
                    .as_ref()
                    .is_some_and(|c| c.psm == psm && c.state == L2capState::Connectable)
            })
            .map(|e| e.id)
    }

    pub fn purge_unused(&mut self) {
        self.elements.retain(|e| e.conn.is_some());
        self.active_element = None;
    }
}
