//! Session Registry: pending and active sessions plus per-client request queues
//!
//! All registry state sits behind one reader/writer lock. Session locks are
//! never taken while that lock is held, and nothing awaits under it: callers
//! read what they need from a session first, then touch the registry.

pub mod bridge;
pub mod manager;

pub use bridge::BridgeError;
pub use manager::{CommandError, LifecycleManager};

use crate::session::ConnectionSession;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A request waiting for the client to pick it up with GREQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    /// Per-session sequence number
    pub seq: u64,
    /// Encrypted payload handed to the client verbatim
    pub data: String,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pending: usize,
    pub active: usize,
    pub queued_requests: usize,
    pub waiting_responses: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// Unauthenticated sessions: remote address -> session
    pending: HashMap<SocketAddr, Arc<ConnectionSession>>,
    /// Authenticated sessions: client identity -> session
    active: HashMap<String, Arc<ConnectionSession>>,
    /// Requests not yet picked up: identity -> seq -> request
    requests: HashMap<String, BTreeMap<u64, String>>,
    /// Bridge callers waiting for SRSP: identity -> seq -> waiter
    responses: HashMap<String, HashMap<u64, oneshot::Sender<String>>>,
}

impl RegistryInner {
    /// Whether `identity` is currently held by connection `conn_id`
    fn holds(&self, identity: &str, conn_id: u64) -> bool {
        self.active.get(identity).map_or(false, |s| s.id() == conn_id)
    }
}

/// Process-wide set of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection
    pub fn insert_pending(&self, session: Arc<ConnectionSession>) {
        let addr = session.remote_addr();
        self.inner.write().pending.insert(addr, session);
    }

    /// Move `session` from pending to active under `identity`.
    ///
    /// Runs under a single write lock, so readers see the session in exactly
    /// one of the two maps. If another connection held the identity it is
    /// removed (with its queued requests and waiters) and returned; the caller
    /// closes it. Promoting an already-active session is a no-op.
    pub fn promote(
        &self,
        session: &Arc<ConnectionSession>,
        identity: &str,
    ) -> Option<Arc<ConnectionSession>> {
        let mut inner = self.inner.write();

        if inner.holds(identity, session.id()) {
            return None;
        }

        let addr = session.remote_addr();
        if inner.pending.get(&addr).map_or(false, |s| s.id() == session.id()) {
            inner.pending.remove(&addr);
        }

        let displaced = inner.active.insert(identity.to_string(), session.clone());
        inner.requests.insert(identity.to_string(), BTreeMap::new());
        // Dropping the old waiters wakes their bridge callers
        inner.responses.insert(identity.to_string(), HashMap::new());

        displaced.filter(|old| old.id() != session.id())
    }

    /// Forget `session`. A session that was already displaced by a newer one
    /// never removes its successor.
    ///
    /// Returns `true` when an entry was removed.
    pub fn remove(&self, session: &ConnectionSession, identity: &str) -> bool {
        let mut inner = self.inner.write();
        let mut removed = false;

        let addr = session.remote_addr();
        if inner.pending.get(&addr).map_or(false, |s| s.id() == session.id()) {
            inner.pending.remove(&addr);
            removed = true;
        }

        if !identity.is_empty() && inner.holds(identity, session.id()) {
            inner.active.remove(identity);
            inner.requests.remove(identity);
            inner.responses.remove(identity);
            removed = true;
        }

        removed
    }

    /// Active session holding `identity`
    pub fn active(&self, identity: &str) -> Option<Arc<ConnectionSession>> {
        self.inner.read().active.get(identity).cloned()
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.inner.read().active.contains_key(identity)
    }

    pub fn active_sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.inner.read().active.values().cloned().collect()
    }

    pub fn pending_sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.inner.read().pending.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            pending: inner.pending.len(),
            active: inner.active.len(),
            queued_requests: inner.requests.values().map(|q| q.len()).sum(),
            waiting_responses: inner.responses.values().map(|w| w.len()).sum(),
        }
    }

    // ------------------------------------------------------------------
    // Request / response correlation
    // ------------------------------------------------------------------

    /// Queue `request` for `identity` and register the waiter for its reply.
    ///
    /// Fails when connection `conn_id` no longer holds the identity.
    pub fn enqueue_request(
        &self,
        identity: &str,
        conn_id: u64,
        request: QueuedRequest,
        waiter: oneshot::Sender<String>,
    ) -> Result<(), BridgeError> {
        let mut inner = self.inner.write();
        if !inner.holds(identity, conn_id) {
            return Err(BridgeError::ClientNotFound(identity.to_string()));
        }

        inner
            .requests
            .entry(identity.to_string())
            .or_default()
            .insert(request.seq, request.data);
        inner
            .responses
            .entry(identity.to_string())
            .or_default()
            .insert(request.seq, waiter);
        Ok(())
    }

    /// Remove and return the oldest queued request for `identity`
    pub fn take_request(&self, identity: &str) -> Option<QueuedRequest> {
        let mut inner = self.inner.write();
        let (seq, data) = inner.requests.get_mut(identity)?.pop_first()?;
        Some(QueuedRequest { seq, data })
    }

    /// Hand a client reply to the caller waiting on `(identity, seq)`.
    ///
    /// Returns `false` when nobody is waiting any more.
    pub fn deliver_response(&self, identity: &str, conn_id: u64, seq: u64, data: String) -> bool {
        let waiter = {
            let mut inner = self.inner.write();
            if !inner.holds(identity, conn_id) {
                return false;
            }
            inner.responses.get_mut(identity).and_then(|w| w.remove(&seq))
        };

        match waiter {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Withdraw a request and its waiter, whether or not it was picked up
    pub fn cancel_request(&self, identity: &str, conn_id: u64, seq: u64) {
        let mut inner = self.inner.write();
        if !inner.holds(identity, conn_id) {
            return;
        }
        if let Some(queue) = inner.requests.get_mut(identity) {
            queue.remove(&seq);
        }
        if let Some(waiters) = inner.responses.get_mut(identity) {
            waiters.remove(&seq);
        }
    }

    /// Whether the request and response maps exist for `identity`
    pub fn has_queues(&self, identity: &str) -> bool {
        let inner = self.inner.read();
        inner.requests.contains_key(identity) && inner.responses.contains_key(identity)
    }
}

// ============================================================================
// TESTS
// ============================================================================
