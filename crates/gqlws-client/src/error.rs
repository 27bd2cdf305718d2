//! Error types for the subscription client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gqlws_streaming::StreamError;

/// GraphQL error location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    /// Line number in the query (1-based).
    pub line: u32,
    /// Column number in the query (1-based).
    pub column: u32,
}

/// GraphQL error (per GraphQL spec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable error message.
    pub message: String,
    /// Location(s) within the query.
    #[serde(default)]
    pub locations: Vec<GraphqlErrorLocation>,
    /// Path within the response where the error occurred.
    #[serde(default)]
    pub path: Vec<serde_json::Value>,
    /// Extensions metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

/// Error type for subscription client operations.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] StreamError),

    /// Error payload sent by the server, message reproduced verbatim.
    #[error("{0}")]
    Server(String),

    /// Protocol violation on the wire.
    #[error("GraphQL protocol error: {message}")]
    Protocol {
        /// Details.
        message: String,
    },

    /// The server did not acknowledge the connection in time.
    #[error("connection_ack timeout after {0:?}")]
    AckTimeout(Duration),

    /// No keepalive received within the configured window.
    #[error("keepalive timeout after {0:?}")]
    KeepAliveTimeout(Duration),

    /// A data handler requested shutdown; its message is reproduced verbatim.
    #[error("{0}")]
    HandlerExit(String),

    /// No subscription registered under the given key.
    #[error("subscription not found: {0}")]
    NotFound(String),

    /// A second `run` was attempted while one is active.
    #[error("the subscription client is already running")]
    AlreadyRunning,

    /// A retry status-code expression could not be parsed.
    #[error("invalid status code; input: {0}")]
    InvalidStatusCode(String),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl SubscriptionError {
    /// WebSocket close code carried by this error, if any.
    #[must_use]
    pub const fn close_status(&self) -> Option<u16> {
        match self {
            Self::Transport(err) => err.close_status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_displays_verbatim() {
        let err = SubscriptionError::Server(
            "invalid x-hasura-admin-secret/x-hasura-access-key".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid x-hasura-admin-secret/x-hasura-access-key"
        );
    }

    #[test]
    fn handler_exit_displays_verbatim() {
        let err = SubscriptionError::HandlerExit("exit".to_string());
        assert_eq!(err.to_string(), "exit");
    }

    #[test]
    fn close_status_comes_from_transport() {
        let err = SubscriptionError::Transport(StreamError::ConnectionClosed {
            reason: "bad request".into(),
            code: Some(4400),
        });
        assert_eq!(err.close_status(), Some(4400));
        assert_eq!(SubscriptionError::Server("x".into()).close_status(), None);
    }

    #[test]
    fn graphql_error_deserializes_with_defaults() {
        let err: GraphqlError = serde_json::from_str(r#"{"message": "boom"}"#).unwrap();
        assert_eq!(err.message, "boom");
        assert!(err.locations.is_empty());
        assert!(err.path.is_empty());
    }
}
