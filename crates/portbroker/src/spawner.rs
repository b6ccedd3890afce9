//! Child process launching.
//!
//! `START` payloads name a program by relative path segments. The spawner
//! resolves them against a configured child root and execs the program
//! directly with an argument list - no shell, so no quoting hazards. The
//! session id goes last on the argv, per the report-back contract; the
//! broker's own address rides along in `PORTBROKER_ADDR` so children of a
//! broker bound to an ephemeral port can still find it.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::process::{Child, Command};

use crate::protocol::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("empty launch path")]
    EmptyPath,

    /// Absolute segments and `..` would let a client walk out of the child
    /// root; the launch path contract is strictly relative.
    #[error("launch path escapes the child root: {0}")]
    PathEscape(String),

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: PathBuf,
        source: io::Error,
    },
}

/// What a spawner needs to launch one child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Relative path segments from the `START` payload, joined to locate the
    /// program.
    pub segments: Vec<String>,
    /// Session id the child must echo back in its `PORT` report.
    pub session: SessionId,
    /// Address the child should connect back to.
    pub broker_addr: String,
}

/// Seam between the dispatcher and process creation, so tests can substitute
/// a child that never exists or never reports back.
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError>;
}

/// Spawner that execs programs found under a fixed root directory.
pub struct ProgramSpawner {
    root: PathBuf,
}

impl ProgramSpawner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, segments: &[String]) -> Result<PathBuf, SpawnError> {
        if segments.is_empty() {
            return Err(SpawnError::EmptyPath);
        }

        let relative: PathBuf = segments.iter().collect();
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(SpawnError::PathEscape(relative.display().to_string())),
            }
        }

        Ok(self.root.join(relative))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChildSpawner for ProgramSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError> {
        let program = self.resolve(&request.segments)?;

        tracing::debug!(
            program = %program.display(),
            session = %request.session,
            "spawning child"
        );

        Command::new(&program)
            .arg(request.session.to_string())
            .env("PORTBROKER_ADDR", &request.broker_addr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io { program, source })
    }
}
