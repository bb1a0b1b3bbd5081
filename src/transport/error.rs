//! Error types for the transport layer.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::session::bypass::BypassError;
use crate::session::decorator::DecorateError;

/// Result alias used by frame-level transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Why the upgrade handshake did not produce an open connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("tls negotiation failed: {0}")]
    Tls(String),
    #[error("upgrade rejected with status {status}")]
    Rejected { status: u16 },
    #[error("proxy tunnel failed: {0}")]
    Proxy(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake cancelled")]
    Cancelled,
    #[error("invalid upgrade request: {0}")]
    InvalidRequest(String),
}

impl HandshakeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandshakeError::Cancelled)
    }

    /// Rejections the gateway issues when the clearance is missing or stale.
    pub fn is_gateway_rejection(&self) -> bool {
        matches!(
            self,
            HandshakeError::Rejected {
                status: 401 | 403 | 429 | 503
            }
        )
    }
}

impl From<tungstenite::Error> for HandshakeError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => HandshakeError::Rejected {
                status: response.status().as_u16(),
            },
            tungstenite::Error::Tls(err) => HandshakeError::Tls(err.to_string()),
            tungstenite::Error::Url(err) => HandshakeError::InvalidRequest(err.to_string()),
            tungstenite::Error::HttpFormat(err) => HandshakeError::InvalidRequest(err.to_string()),
            other => HandshakeError::Connect(other.to_string()),
        }
    }
}

/// Frames the connection refuses to interpret.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("message exceeds size limit: {0}")]
    Capacity(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Capacity(err) => ProtocolError::Capacity(err.to_string()).into(),
            tungstenite::Error::Protocol(err) => ProtocolError::Malformed(err.to_string()).into(),
            other => TransportError::Io(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("data can not be sent while the connection is not open")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
#[error("uri provider failed: {0}")]
pub struct UriError(pub String);

/// Everything that can go wrong with the link, as reported to observers.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("preflight failed: {0}")]
    Bypass(#[from] BypassError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request decoration failed: {0}")]
    Decorate(#[from] DecorateError),
    #[error("uri provider failed: {0}")]
    Uri(String),
}

impl From<UriError> for LinkError {
    fn from(err: UriError) -> Self {
        LinkError::Uri(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_rejections() {
        assert!(HandshakeError::Rejected { status: 403 }.is_gateway_rejection());
        assert!(HandshakeError::Rejected { status: 503 }.is_gateway_rejection());
        assert!(!HandshakeError::Rejected { status: 404 }.is_gateway_rejection());
        assert!(!HandshakeError::Timeout(Duration::from_secs(10)).is_gateway_rejection());
    }

    #[test]
    fn only_cancellation_is_final() {
        assert!(HandshakeError::Connect("refused".into()).is_retryable());
        assert!(HandshakeError::Rejected { status: 403 }.is_retryable());
        assert!(!HandshakeError::Cancelled.is_retryable());
    }
}
