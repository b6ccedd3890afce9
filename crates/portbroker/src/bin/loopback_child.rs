//! Minimal child honoring the broker's report-back contract.
//!
//! Launched as `loopback_child <session-id>`. Binds an ephemeral port, opens
//! its own connection to the broker (address from `PORTBROKER_ADDR`) to send
//! `PORT <session-id> <port>`, then echoes bytes on every connection until
//! terminated. Stands in for the device-server children the broker exists to
//! manage; the integration tests launch it through a real `START`.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let session = std::env::args()
        .last()
        .context("missing session id argument")?
        .parse::<u64>()
        .context("session id is not an integer")?;

    let broker_addr = std::env::var("PORTBROKER_ADDR")
        .unwrap_or_else(|_| format!("127.0.0.1:{}", portbroker::DEFAULT_PORT));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    // Report back on a fresh connection, as the contract requires.
    let mut broker = TcpStream::connect(&broker_addr)
        .await
        .with_context(|| format!("cannot reach broker at {broker_addr}"))?;
    broker
        .write_all(format!("PORT {session} {port}").as_bytes())
        .await?;
    let mut ack = [0u8; 8];
    let _ = broker.read(&mut ack).await;
    drop(broker);

    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
