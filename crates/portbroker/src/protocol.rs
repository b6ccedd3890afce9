//! Wire protocol for the broker's command socket.
//!
//! One request/response pair per TCP connection, text-based:
//! - `START <path segments>` → port the child bound, as decimal text
//! - `STOP <port>` → single space byte (ack)
//! - `PORT <session-id> <port>` → single space byte (ack)
//!
//! Verbs match case-insensitively. The payload is whatever follows the first
//! space byte; further whitespace splitting happens per verb. Proxy clients
//! parse the `START` reply with a bare integer conversion and ignore ack
//! bytes, so those two response shapes are load-bearing.

/// Single acknowledgement byte written for `STOP` and `PORT`.
pub const ACK: &[u8] = b" ";

/// Identifier for one child-process lifecycle.
///
/// Monotonically increasing, allocated by the registry, never reused within
/// one broker lifetime. The child receives it as its trailing launch argument
/// and echoes it back in its `PORT` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed request, one per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Launch a child; payload segments locate the program under the child root.
    Start { segments: Vec<String> },
    /// Terminate the child registered under this port.
    Stop { port: u16 },
    /// Child's report-back: it bound `port` and was launched as `session`.
    Port { session: SessionId, port: u16 },
}

/// Response written back before the connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `START` reply: the port the child reported, as ASCII decimal.
    Port(u16),
    /// `STOP`/`PORT` reply: the single-space ack.
    Ack,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Port(port) => port.to_string().into_bytes(),
            Response::Ack => ACK.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,

    #[error("request is not valid UTF-8")]
    NotUtf8,

    /// The original broker dropped these connections without a reply; we
    /// surface them so clients can tell a typo from a network fault.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("malformed {verb} payload: {detail}")]
    Malformed { verb: &'static str, detail: String },
}

fn malformed(verb: &'static str, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        verb,
        detail: detail.into(),
    }
}

/// Parse one raw request. Strict split on the first space byte; the verb is
/// matched case-insensitively and the remainder is handed to the per-verb
/// payload parser.
pub fn parse(raw: &[u8]) -> Result<Request, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::NotUtf8)?
        .trim_end_matches(['\r', '\n']);

    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let (verb, payload) = match text.split_once(' ') {
        Some((verb, payload)) => (verb, payload),
        None => (text, ""),
    };

    if verb.eq_ignore_ascii_case("START") {
        parse_start(payload)
    } else if verb.eq_ignore_ascii_case("STOP") {
        parse_stop(payload)
    } else if verb.eq_ignore_ascii_case("PORT") {
        parse_port(payload)
    } else {
        Err(ProtocolError::UnknownVerb(verb.to_string()))
    }
}

fn parse_start(payload: &str) -> Result<Request, ProtocolError> {
    let segments: Vec<String> = payload
        .split_ascii_whitespace()
        .map(str::to_string)
        .collect();

    if segments.is_empty() {
        return Err(malformed("START", "missing launch path"));
    }

    Ok(Request::Start { segments })
}

fn parse_stop(payload: &str) -> Result<Request, ProtocolError> {
    let port = payload
        .trim()
        .parse::<u16>()
        .map_err(|_| malformed("STOP", format!("expected a port number, got {payload:?}")))?;

    Ok(Request::Stop { port })
}

fn parse_port(payload: &str) -> Result<Request, ProtocolError> {
    let mut parts = payload.split_ascii_whitespace();

    let session = parts
        .next()
        .ok_or_else(|| malformed("PORT", "missing session id"))?
        .parse::<u64>()
        .map_err(|_| malformed("PORT", format!("bad session id in {payload:?}")))?;

    let port = parts
        .next()
        .ok_or_else(|| malformed("PORT", "missing port number"))?
        .parse::<u16>()
        .map_err(|_| malformed("PORT", format!("bad port number in {payload:?}")))?;

    if parts.next().is_some() {
        return Err(malformed("PORT", format!("trailing garbage in {payload:?}")));
    }

    Ok(Request::Port {
        session: SessionId::new(session),
        port,
    })
}
