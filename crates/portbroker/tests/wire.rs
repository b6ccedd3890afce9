//! End-to-end tests over the real TCP wire, driving the broker exactly the
//! way the remote proxy clients do: one connection per command, raw text in,
//! raw text out. `START` launches the real `loopback_child` binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;

use portbroker::{ChildSpawner, Server, ServerConfig, SpawnError, SpawnRequest};

const CHILD_BIN: &str = env!("CARGO_BIN_EXE_loopback_child");

fn test_config() -> ServerConfig {
    let child = PathBuf::from(CHILD_BIN);
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        child_root: child.parent().expect("binary has a parent dir").into(),
        ..ServerConfig::default()
    }
}

fn child_segment() -> String {
    PathBuf::from(CHILD_BIN)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

/// One command, one connection: write the request, read the whole reply.
async fn request(addr: SocketAddr, msg: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(msg.as_bytes()).await.expect("write");

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.expect("read");
    String::from_utf8(reply).expect("utf8 reply")
}

#[tokio::test]
async fn start_report_stop_lifecycle() {
    let addr = start_server(test_config()).await;

    let reply = request(addr, &format!("START {}", child_segment())).await;
    let port: u16 = reply.parse().expect("START reply is a decimal port");

    // The child is a live echo server on the reported port.
    let mut echo = TcpStream::connect(("127.0.0.1", port)).await.expect("child up");
    echo.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    echo.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    drop(echo);

    assert_eq!(request(addr, &format!("STOP {port}")).await, " ");

    // The registry entry is gone; so is the child.
    let reply = request(addr, &format!("STOP {port}")).await;
    assert!(reply.starts_with("ERR "), "expected ERR, got {reply:?}");
    assert!(reply.contains("no child registered"), "got {reply:?}");
}

#[tokio::test]
async fn concurrent_starts_get_independent_ports() {
    let addr = start_server(test_config()).await;
    let segment = child_segment();

    let msg_a = format!("START {segment}");
    let msg_b = format!("START {segment}");
    let a = tokio::spawn(async move { request(addr, &msg_a).await });
    let b = tokio::spawn(async move { request(addr, &msg_b).await });

    let port_a: u16 = a.await.unwrap().parse().expect("port a");
    let port_b: u16 = b.await.unwrap().parse().expect("port b");
    assert_ne!(port_a, port_b);

    assert_eq!(request(addr, &format!("STOP {port_a}")).await, " ");
    assert_eq!(request(addr, &format!("STOP {port_b}")).await, " ");
}

#[tokio::test]
async fn unknown_verb_gets_an_err_line() {
    let addr = start_server(test_config()).await;

    let reply = request(addr, "PING anyone-home").await;
    assert!(reply.starts_with("ERR "), "got {reply:?}");
    assert!(reply.contains("unknown verb"), "got {reply:?}");
}

#[tokio::test]
async fn malformed_stop_gets_an_err_line() {
    let addr = start_server(test_config()).await;

    let reply = request(addr, "STOP not-a-port").await;
    assert!(reply.starts_with("ERR "), "got {reply:?}");
}

#[tokio::test]
async fn missing_program_reports_spawn_failure() {
    let addr = start_server(test_config()).await;

    let reply = request(addr, "START no_such_program").await;
    assert!(reply.starts_with("ERR spawn failed"), "got {reply:?}");
}

#[tokio::test]
async fn stale_port_report_gets_an_err_line() {
    let addr = start_server(test_config()).await;

    let reply = request(addr, "PORT 4242 5001").await;
    assert!(reply.starts_with("ERR "), "got {reply:?}");
    assert!(reply.contains("no handshake pending"), "got {reply:?}");
}

/// Spawns an inert child that never reports back.
struct MuteSpawner;

impl ChildSpawner for MuteSpawner {
    fn spawn(&self, _request: &SpawnRequest) -> Result<tokio::process::Child, SpawnError> {
        Command::new("sleep")
            .arg("300")
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io {
                program: "sleep".into(),
                source,
            })
    }
}

#[tokio::test]
async fn silent_child_times_out_with_an_err_line() {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = Server::bind_with(config, |_| Arc::new(MuteSpawner))
        .await
        .expect("bind");
    let addr = server.local_addr();
    tokio::spawn(server.run());

    let reply = request(addr, "START mute").await;
    assert!(reply.starts_with("ERR handshake timed out"), "got {reply:?}");
}
