//! portbroker: TCP broker for spawning device-server children on demand.
//!
//! A client sends `START <path>` on one connection; the broker spawns the
//! named child with a fresh session id, the child binds a port and reports it
//! back on a second connection (`PORT <session> <port>`), and the original
//! client gets the port. `STOP <port>` terminates the child later.

pub mod broker;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod spawner;

pub use broker::{Broker, BrokerError, DEFAULT_HANDSHAKE_TIMEOUT};
pub use protocol::{ACK, ProtocolError, Request, Response, SessionId};
pub use registry::{RegistryError, SessionRegistry};
pub use server::{DEFAULT_PORT, MAX_REQUEST_BYTES, Server, ServerConfig};
pub use spawner::{ChildSpawner, ProgramSpawner, SpawnError, SpawnRequest};
