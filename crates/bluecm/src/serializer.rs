//! Subsystem serializer: lock token plus save queue.
//!
//! Each controller-side resource tolerates one outstanding command at a
//! time. A serializer enforces that: while the token is held, same-class
//! requests are appended to the save queue instead of dispatched. The
//! unlock must always be followed, in the same synchronous step, by either
//! dispatch of the next saved request or an explicit empty-queue
//! resolution; that sequencing lives in the router
//! (`CmContext::complete_and_restore`), never here.

use std::collections::VecDeque;

use log::debug;

use crate::dispatch::{Request, RequestKind};

#[derive(Debug)]
pub struct Serializer {
    name: &'static str,
    lock: Option<RequestKind>,
    save_queue: VecDeque<Request>,
}

impl Serializer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: None,
            save_queue: VecDeque::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// The request kind currently in flight, if any.
    pub fn lock_token(&self) -> Option<RequestKind> {
        self.lock
    }

    pub fn lock(&mut self, kind: RequestKind) {
        debug!("[{} queue] locked by {:?}", self.name, kind);
        self.lock = Some(kind);
    }

    pub fn unlock(&mut self) {
        debug!("[{} queue] unlocked from {:?}", self.name, self.lock);
        self.lock = None;
    }

    /// Appends a request that arrived while the token was held.
    pub fn defer(&mut self, request: Request) {
        debug!(
            "[{} queue] deferring {:?} ({} queued)",
            self.name,
            request.kind(),
            self.save_queue.len() + 1
        );
        self.save_queue.push_back(request);
    }

    /// Pops the oldest deferred request.
    pub fn take_deferred(&mut self) -> Option<Request> {
        self.save_queue.pop_front()
    }

    /// Removes and returns the first deferred request matching the
    /// predicate, used when a cancel arrives for a request that never
    /// reached the controller.
    pub fn remove_deferred(&mut self, pred: impl Fn(&Request) -> bool) -> Option<Request> {
        let pos = self.save_queue.iter().position(|r| pred(r))?;
        self.save_queue.remove(pos)
    }

    pub fn queued(&self) -> usize {
        self.save_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppHandle, BdAddr, TypedAddr};
    use crate::controller::AclFlags;

    fn close_request(app: u16) -> Request {
        Request::AclClose {
            app: AppHandle(app),
            addr: TypedAddr::public(BdAddr::new([1, 0, 0, 0, 0, 0])),
            flags: AclFlags::FORCE,
            reason: crate::controller::HCI_ERROR_OETC_USER,
        }
    }

    #[test]
    fn test_single_flight() {
        let mut s = Serializer::new("test");
        assert!(!s.is_locked());

        s.lock(RequestKind::AclClose);
        assert!(s.is_locked());
        assert_eq!(s.lock_token(), Some(RequestKind::AclClose));

        s.defer(close_request(1));
        s.defer(close_request(2));
        assert_eq!(s.queued(), 2);

        s.unlock();
        assert!(!s.is_locked());

        match s.take_deferred() {
            Some(Request::AclClose { app, .. }) => assert_eq!(app, AppHandle(1)),
            other => panic!("unexpected: {:?}", other),
        }
        match s.take_deferred() {
            Some(Request::AclClose { app, .. }) => assert_eq!(app, AppHandle(2)),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(s.take_deferred().is_none());
    }

    #[test]
    fn test_remove_deferred() {
        let mut s = Serializer::new("test");
        s.lock(RequestKind::AclClose);
        s.defer(close_request(1));
        s.defer(close_request(2));

        let removed = s.remove_deferred(|r| matches!(r, Request::AclClose { app, .. } if *app == AppHandle(2)));
        assert!(removed.is_some());
        assert_eq!(s.queued(), 1);

        let missing = s.remove_deferred(|r| matches!(r, Request::AclClose { app, .. } if *app == AppHandle(7)));
        assert!(missing.is_none());
    }
}
