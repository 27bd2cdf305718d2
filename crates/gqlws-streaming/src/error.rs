//! Transport error types.

use std::time::Duration;

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Connection failed before the upgrade completed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote endpoint closed the connection.
    #[error("Connection closed: {reason}")]
    ConnectionClosed {
        /// Close reason sent by the peer, empty when none was given.
        reason: String,
        /// WebSocket close code, `None` when the peer vanished without one.
        code: Option<u16>,
    },

    /// Message could not be serialized or parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Operation attempted on a closed connection.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol-level WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

impl StreamError {
    /// WebSocket close code carried by this error, if any.
    ///
    /// Mirrors the close-status convention of the wire: a connection torn
    /// down without a close frame reports `None`.
    #[must_use]
    pub const fn close_status(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            _ => None,
        }
    }
}

/// Result type for transport operations.
pub type StreamResult<T> = Result<T, StreamError>;
