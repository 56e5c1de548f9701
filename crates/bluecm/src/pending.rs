//! Pending-request queue.
//!
//! Holds requests whose completion is deferred behind an in-flight
//! controller command. Entries are owned values moved in and out of the
//! queue; there is nothing to free on the exit paths.
//!
//! The queue is used two ways: as a true FIFO (remote-version reads are
//! serviced one at a time, the next kicked after each confirmation) and as
//! an associative store (ACL-open parameters looked up by address and
//! transport when the confirmation, or a racing close, arrives).

use std::collections::VecDeque;

use crate::controller::AclFlags;
use crate::l2cap::Psm;
use crate::types::{AppHandle, BdAddr, Transport, TypedAddr};

/// Discriminant of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    RemoteVersion,
    SupervisionTimeout,
    AclOpen,
    L2capUnregister,
    HandleOnly,
}

/// One deferred request, keyed by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    RemoteVersion {
        app: AppHandle,
        addr: BdAddr,
        transport: Transport,
    },
    SupervisionTimeout {
        app: AppHandle,
        addr: BdAddr,
        timeout: u16,
    },
    AclOpen {
        app: AppHandle,
        addr: TypedAddr,
        flags: AclFlags,
    },
    L2capUnregister {
        app: AppHandle,
        psm: Psm,
    },
    HandleOnly {
        app: AppHandle,
    },
}

impl PendingRequest {
    pub fn kind(&self) -> PendingKind {
        match self {
            PendingRequest::RemoteVersion { .. } => PendingKind::RemoteVersion,
            PendingRequest::SupervisionTimeout { .. } => PendingKind::SupervisionTimeout,
            PendingRequest::AclOpen { .. } => PendingKind::AclOpen,
            PendingRequest::L2capUnregister { .. } => PendingKind::L2capUnregister,
            PendingRequest::HandleOnly { .. } => PendingKind::HandleOnly,
        }
    }
}

/// FIFO of deferred requests with associative lookup.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, entry: PendingRequest) {
        self.entries.push_back(entry);
    }

    /// First entry of the given kind, in FIFO order.
    pub fn find_first(&self, kind: PendingKind) -> Option<&PendingRequest> {
        self.entries.iter().find(|e| e.kind() == kind)
    }

    /// First entry matching the predicate.
    pub fn find(&self, pred: impl Fn(&PendingRequest) -> bool) -> Option<&PendingRequest> {
        self.entries.iter().find(|e| pred(e))
    }

    /// Removes and returns the first entry of the given kind.
    pub fn remove_first(&mut self, kind: PendingKind) -> Option<PendingRequest> {
        self.remove_matching(|e| e.kind() == kind)
    }

    /// Removes and returns the first entry matching the predicate.
    pub fn remove_matching(
        &mut self,
        pred: impl Fn(&PendingRequest) -> bool,
    ) -> Option<PendingRequest> {
        let pos = self.entries.iter().position(|e| pred(e))?;
        self.entries.remove(pos)
    }

    /// Removes every entry matching the predicate, returning the removed
    /// entries in FIFO order.
    pub fn remove_all(&mut self, pred: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if pred(e) {
                removed.push(e.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_entry(app: u16, lap: u8) -> PendingRequest {
        PendingRequest::RemoteVersion {
            app: AppHandle(app),
            addr: BdAddr::new([lap, 0, 0, 0, 0, 1]),
            transport: Transport::BrEdr,
        }
    }

    #[test]
    fn test_fifo_order_per_kind() {
        let mut q = PendingQueue::new();
        q.push(version_entry(1, 0xAA));
        q.push(PendingRequest::HandleOnly {
            app: AppHandle(9),
        });
        q.push(version_entry(2, 0xBB));

        match q.remove_first(PendingKind::RemoteVersion) {
            Some(PendingRequest::RemoteVersion { app, .. }) => assert_eq!(app, AppHandle(1)),
            other => panic!("unexpected entry: {:?}", other),
        }
        match q.remove_first(PendingKind::RemoteVersion) {
            Some(PendingRequest::RemoteVersion { app, .. }) => assert_eq!(app, AppHandle(2)),
            other => panic!("unexpected entry: {:?}", other),
        }
        assert!(q.remove_first(PendingKind::RemoteVersion).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_associative_removal() {
        let mut q = PendingQueue::new();
        let addr = TypedAddr::public(BdAddr::new([1, 2, 3, 4, 5, 6]));
        q.push(PendingRequest::AclOpen {
            app: AppHandle(3),
            addr,
            flags: AclFlags::empty(),
        });
        q.push(version_entry(1, 0xAA));

        let removed = q.remove_all(|e| {
            matches!(e, PendingRequest::AclOpen { addr: a, .. } if *a == addr)
        });
        assert_eq!(removed.len(), 1);
        assert_eq!(q.len(), 1);
        assert!(q.find_first(PendingKind::AclOpen).is_none());
    }
}
