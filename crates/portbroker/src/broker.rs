//! Command dispatcher - routes parsed requests to the three handlers.
//!
//! Flow for `START`:
//! 1. Allocate a session id and its pending handshake
//! 2. Spawn the child, session id as trailing argument
//! 3. Await the one-shot until the child's `PORT` report arrives (bounded;
//!    the original waited forever)
//! 4. Register port → child, reply with the port
//!
//! The `PORT` report arrives on a different connection than the `START` that
//! caused it - the child opens its own connection once it has bound a port.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;

use crate::protocol::{self, ProtocolError, Request, Response, SessionId};
use crate::registry::{RegistryError, SessionRegistry};
use crate::spawner::{ChildSpawner, SpawnError, SpawnRequest};

/// How long `START` waits for the child's `PORT` report before giving up and
/// reaping the child.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The child never reported back within the handshake window. The session
    /// id is retired and the child has been reaped.
    #[error("handshake timed out for session {0}")]
    HandshakeTimeout(SessionId),

    /// The pending handshake vanished without being signaled. Only reachable
    /// if something abandons the session while `START` is still waiting.
    #[error("handshake aborted for session {0}")]
    HandshakeAborted(SessionId),

    #[error("failed to terminate child on port {port}: {source}")]
    Terminate { port: u16, source: io::Error },
}

/// The broker core: registry plus spawner. One instance shared by every
/// connection handler; all state lives in the registry.
pub struct Broker {
    registry: SessionRegistry<Child>,
    spawner: Arc<dyn ChildSpawner>,
    /// Address children are told to report back to.
    advertised_addr: String,
    handshake_timeout: Duration,
}

impl Broker {
    pub fn new(spawner: Arc<dyn ChildSpawner>, advertised_addr: impl Into<String>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            spawner,
            advertised_addr: advertised_addr.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Parse one raw request and route it to exactly one handler.
    pub async fn dispatch(&self, raw: &[u8]) -> Result<Response, BrokerError> {
        match protocol::parse(raw)? {
            Request::Start { segments } => self.start(segments).await,
            Request::Stop { port } => self.stop(port).await,
            Request::Port { session, port } => self.report_port(session, port),
        }
    }

    async fn start(&self, segments: Vec<String>) -> Result<Response, BrokerError> {
        let (session, port_rx) = self.registry.allocate_session();
        tracing::debug!(%session, ?segments, "START accepted");

        let request = SpawnRequest {
            segments,
            session,
            broker_addr: self.advertised_addr.clone(),
        };

        let mut child = match self.spawner.spawn(&request) {
            Ok(child) => child,
            Err(e) => {
                self.registry.abandon(session);
                return Err(e.into());
            }
        };

        match tokio::time::timeout(self.handshake_timeout, port_rx).await {
            Ok(Ok(port)) => {
                self.registry.register(port, child);
                tracing::info!(%session, port, "child reported in");
                Ok(Response::Port(port))
            }
            Ok(Err(_)) => {
                tracing::error!(%session, "pending handshake dropped while waiting");
                reap(&mut child).await;
                Err(BrokerError::HandshakeAborted(session))
            }
            Err(_) => {
                // Invalidate the handshake first so a late PORT report lands
                // as StaleHandshake instead of signaling a dropped receiver.
                self.registry.abandon(session);
                tracing::warn!(%session, timeout = ?self.handshake_timeout, "handshake timed out");
                reap(&mut child).await;
                Err(BrokerError::HandshakeTimeout(session))
            }
        }
    }

    async fn stop(&self, port: u16) -> Result<Response, BrokerError> {
        let mut child = self.registry.remove(port)?;
        tracing::debug!(port, "STOP accepted");

        terminate(&mut child)
            .await
            .map_err(|source| BrokerError::Terminate { port, source })?;

        tracing::info!(port, "child terminated");
        Ok(Response::Ack)
    }

    fn report_port(&self, session: SessionId, port: u16) -> Result<Response, BrokerError> {
        self.registry.record_port(session, port)?;
        tracing::debug!(%session, port, "PORT report delivered");
        Ok(Response::Ack)
    }

    pub fn running(&self) -> usize {
        self.registry.running()
    }
}

/// Ask the child to exit and wait for it, the same synchronous-wait semantics
/// as the original `terminate(); wait()`. SIGTERM first so the child gets a
/// chance to close its own listening socket.
async fn terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %errno, "SIGTERM failed, escalating to SIGKILL");
            child.kill().await?;
        }
    }

    #[cfg(not(unix))]
    child.start_kill()?;

    child.wait().await?;
    Ok(())
}

/// Best-effort cleanup of a child whose handshake never completed.
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to reap unreported child");
    }
}
