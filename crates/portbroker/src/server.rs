//! Connection server - accept loop and per-connection handling.
//!
//! Each accepted connection carries exactly one request: a single bounded
//! read, one dispatch, one write, close. Connections are served in their own
//! tasks so a `START` blocked on a slow handshake never stalls the accept
//! loop. No pipelining, no retries, no persistent connections.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::broker::{Broker, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::spawner::{ChildSpawner, ProgramSpawner};

/// Largest request the server will read; the original broker read one 1024
/// byte buffer per connection and so do we.
pub const MAX_REQUEST_BYTES: usize = 1024;

/// The broker's well-known listening port.
pub const DEFAULT_PORT: u16 = 42922;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory `START` launch paths are resolved under.
    pub child_root: PathBuf,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            child_root: PathBuf::from("."),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// A bound broker server. `bind` and `run` are split so callers can learn the
/// local address (tests bind port 0) before the accept loop starts.
pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind with the default spawner: programs resolved under the configured
    /// child root.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let child_root = config.child_root.clone();
        Self::bind_with(config, move |_| Arc::new(ProgramSpawner::new(child_root))).await
    }

    /// Bind with a caller-supplied spawner. The closure receives the address
    /// children will be told to report back to.
    pub async fn bind_with<F>(config: ServerConfig, make_spawner: F) -> anyhow::Result<Self>
    where
        F: FnOnce(&str) -> Arc<dyn ChildSpawner>,
    {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let advertised = advertised_addr(local_addr);
        let spawner = make_spawner(&advertised);
        let broker = Arc::new(
            Broker::new(spawner, advertised).with_handshake_timeout(config.handshake_timeout),
        );

        Ok(Self {
            listener,
            broker,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until ctrl-c / SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("portbroker listening on {}", self.local_addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = Arc::clone(&self.broker);
                        tokio::spawn(async move {
                            handle_connection(stream, peer, broker).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown_signal() => break,
            }
        }

        info!("server shutdown complete");
        Ok(())
    }
}

/// Address children are told to report back to. An unspecified bind address
/// is not connectable, so advertise loopback in its place.
fn advertised_addr(local: SocketAddr) -> String {
    if local.ip().is_unspecified() {
        format!("127.0.0.1:{}", local.port())
    } else {
        local.to_string()
    }
}

/// One request, one response, close. Failures are logged and answered with an
/// `ERR` line; they never propagate out of this task, so a bad request cannot
/// take down the accept loop.
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    let mut buf = [0u8; MAX_REQUEST_BYTES];

    let n = match stream.read(&mut buf).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "read failed");
            return;
        }
    };

    let reply = match broker.dispatch(&buf[..n]).await {
        Ok(response) => response.to_bytes(),
        Err(e) => {
            tracing::warn!(%peer, error = %e, "request failed");
            format!("ERR {e}").into_bytes()
        }
    };

    if let Err(e) = stream.write_all(&reply).await {
        tracing::warn!(%peer, error = %e, "write failed");
        return;
    }
    let _ = stream.shutdown().await;
}

/// Wait for ctrl-c or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That is an unrecoverable startup error.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
