//! Connection lifecycle states and termination records.

use std::fmt;

use url::Url;

use crate::session::decorator::UpgradeRequest;

/// Lifecycle of a single [`TransportConnection`](super::connection::TransportConnection).
///
/// ```text
/// Idle -> Connecting -> Open -> Closing -> Closed
///             |           |
///             +-----------+--> Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Faulted,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Faulted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptKind {
    Initial,
    Reconnect,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` or cancellation of the owning token.
    Requested,
    /// The peer sent a close frame.
    Remote { code: Option<u16>, reason: String },
    /// The socket ended without a close frame.
    Eof,
    /// A socket or protocol error.
    Error(String),
    /// The handshake never completed.
    HandshakeFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed by caller"),
            CloseReason::Remote { code: Some(code), reason } => {
                write!(f, "remote close {code} {reason}")
            }
            CloseReason::Remote { code: None, .. } => f.write_str("remote close"),
            CloseReason::Eof => f.write_str("connection dropped"),
            CloseReason::Error(err) => write!(f, "error: {err}"),
            CloseReason::HandshakeFailed(err) => write!(f, "handshake failed: {err}"),
        }
    }
}

/// Terminal record published once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub state: ConnectionState,
    pub reason: CloseReason,
    pub caller_initiated: bool,
}

impl Termination {
    pub fn requested() -> Self {
        Self {
            state: ConnectionState::Closed,
            reason: CloseReason::Requested,
            caller_initiated: true,
        }
    }

    pub fn faulted(reason: CloseReason) -> Self {
        Self {
            state: ConnectionState::Faulted,
            reason,
            caller_initiated: false,
        }
    }
}

/// Everything needed for one connect try. Built fresh per attempt and
/// consumed by [`TransportConnection::start`](super::connection::TransportConnection::start).
#[derive(Debug)]
pub struct ConnectionAttempt {
    pub attempt: u32,
    pub kind: AttemptKind,
    pub uri: Url,
    pub request: UpgradeRequest,
}
