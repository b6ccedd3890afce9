//! Session registry - live children and pending handshakes.
//!
//! Two tables, both mutated by concurrently-running handlers:
//! - pending: session id → one-shot port sender, created by `START`, consumed
//!   by the matching `PORT` report
//! - processes: port → child handle, populated only after the handshake
//!   completes, drained by `STOP`
//!
//! Lock-free concurrent access via DashMap; the session counter is atomic.
//! Each operation touches one entry, so no cross-entry transaction exists.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::protocol::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A `PORT` report for a session that was never started, already
    /// completed its handshake, or whose waiter gave up. The original broker
    /// left this case undefined; here it is a typed protocol error.
    #[error("no handshake pending for session {0}")]
    StaleHandshake(SessionId),

    /// `STOP` for a port nothing is registered under. The original broker
    /// crashed the handler on this lookup; reclassified as a typed error.
    #[error("no child registered on port {0}")]
    NotFound(u16),
}

/// Registry generic over the process handle so tests can exercise the
/// bookkeeping without spawning real children. The broker instantiates it
/// with `tokio::process::Child`.
pub struct SessionRegistry<P> {
    next_session: AtomicU64,
    pending: DashMap<SessionId, oneshot::Sender<u16>>,
    processes: DashMap<u16, P>,
}

impl<P> SessionRegistry<P> {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(0),
            pending: DashMap::new(),
            processes: DashMap::new(),
        }
    }

    /// Allocate a fresh session id and its pending handshake.
    ///
    /// The returned receiver fires exactly once, when the matching `PORT`
    /// report arrives. Session ids start at 1 and are never reused.
    pub fn allocate_session(&self) -> (SessionId, oneshot::Receiver<u16>) {
        let session = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(session, tx);
        (session, rx)
    }

    /// Deliver a child's port report, unblocking the matching `START` waiter.
    ///
    /// The pending entry is removed before signaling, so a second report for
    /// the same session is `StaleHandshake`.
    pub fn record_port(&self, session: SessionId, port: u16) -> Result<(), RegistryError> {
        let (_, tx) = self
            .pending
            .remove(&session)
            .ok_or(RegistryError::StaleHandshake(session))?;

        // The receiver is dropped when the START waiter times out; the report
        // is stale from the child's point of view either way.
        tx.send(port)
            .map_err(|_| RegistryError::StaleHandshake(session))
    }

    /// Drop a pending handshake without signaling it (timeout/spawn-failure
    /// cleanup). A later report for this session becomes `StaleHandshake`.
    pub fn abandon(&self, session: SessionId) {
        self.pending.remove(&session);
    }

    /// Register a running child under the port it reported. Only called after
    /// the handshake completes; before that the child is not addressable.
    pub fn register(&self, port: u16, process: P) {
        self.processes.insert(port, process);
    }

    /// Remove and return the child registered under `port`. A second call for
    /// the same port is `NotFound`.
    pub fn remove(&self, port: u16) -> Result<P, RegistryError> {
        self.processes
            .remove(&port)
            .map(|(_, process)| process)
            .ok_or(RegistryError::NotFound(port))
    }

    pub fn running(&self) -> usize {
        self.processes.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<P> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
