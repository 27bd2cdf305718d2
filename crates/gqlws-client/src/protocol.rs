//! GraphQL-over-WebSocket protocol adapters.
//!
//! Two interoperable sub-protocols share one adapter contract. Adapters are
//! stateless codecs: ack gating, keepalive timers, and start/stop emission
//! all live in the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GraphqlError, SubscriptionError};
use crate::operation::GraphqlRequestPayload;

/// Sub-protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsProtocol {
    /// The current `graphql-ws` protocol (`subscribe`, `next`, `ping`/`pong`).
    #[default]
    GraphqlWs,
    /// The legacy `subscriptions-transport-ws` protocol (`start`, `data`, `ka`).
    SubscriptionsTransportWs,
}

impl WsProtocol {
    /// Value announced in the `Sec-WebSocket-Protocol` upgrade header.
    #[must_use]
    pub const fn subprotocol(self) -> &'static str {
        match self {
            Self::GraphqlWs => "graphql-transport-ws",
            Self::SubscriptionsTransportWs => "graphql-ws",
        }
    }
}

impl std::fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GraphqlWs => f.write_str("graphql-ws"),
            Self::SubscriptionsTransportWs => f.write_str("subscriptions-transport-ws"),
        }
    }
}

/// Wire message common to both sub-protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMessage {
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Operation id, absent on connection-scoped messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Free-form payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationMessage {
    fn new(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            id: None,
            payload: None,
        }
    }

    fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Decoded server-to-client event, demuxed by the engine.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// `connection_ack`, gating all operations.
    Ack,
    /// Liveness signal (`ka`, `pong`).
    KeepAlive,
    /// Server `ping` requiring an immediate `pong`.
    Ping(Option<Value>),
    /// Result payload for a running operation.
    Data {
        /// Per-connection operation id.
        id: String,
        /// Raw `{data, errors}` payload.
        payload: Value,
    },
    /// Error scoped to an operation, or to the connection when `id` is `None`.
    ErrorMsg {
        /// Per-connection operation id, if the error is operation-scoped.
        id: Option<String>,
        /// Raw error payload.
        payload: Value,
    },
    /// Operation finished.
    Complete {
        /// Per-connection operation id.
        id: String,
    },
    /// Unrecognized message type.
    Unknown(String),
}

/// Codec for one GraphQL-over-WebSocket sub-protocol.
pub trait ProtocolAdapter: Send + Sync {
    /// Which sub-protocol this adapter speaks.
    fn protocol(&self) -> WsProtocol;

    /// Build the `connection_init` message.
    fn connection_init(&self, params: Option<Value>) -> OperationMessage;

    /// Build the message starting an operation.
    ///
    /// # Errors
    /// Returns a JSON error if the payload fails to serialize.
    fn start(
        &self,
        id: &str,
        payload: &GraphqlRequestPayload,
    ) -> Result<OperationMessage, SubscriptionError>;

    /// Build the message stopping an operation.
    fn stop(&self, id: &str) -> OperationMessage;

    /// Build the connection-terminate message, if the protocol has one.
    fn terminate(&self) -> Option<OperationMessage>;

    /// Build a `pong` answering a server `ping`, if the protocol has one.
    fn pong(&self, payload: Option<Value>) -> Option<OperationMessage>;

    /// Build a client-initiated `ping`, if the protocol has one.
    fn ping(&self) -> Option<OperationMessage>;

    /// Decode one incoming frame.
    ///
    /// # Errors
    /// Returns a JSON error for undecodable frames and a protocol error for
    /// structurally invalid ones (e.g. `data` without an id).
    fn parse(&self, text: &str) -> Result<ProtocolEvent, SubscriptionError>;
}

/// Resolve the adapter for a configured protocol.
#[must_use]
pub fn adapter_for(protocol: WsProtocol) -> &'static dyn ProtocolAdapter {
    match protocol {
        WsProtocol::GraphqlWs => &GraphqlWsAdapter,
        WsProtocol::SubscriptionsTransportWs => &TransportWsAdapter,
    }
}

/// Flatten an error payload (array, object, or string) to one message.
///
/// The raw payload still travels to id-scoped handlers; this string is what
/// the engine and connection-level hooks see.
#[must_use]
pub(crate) fn normalize_error_payload(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let messages: Vec<String> = items
                .iter()
                .map(|item| {
                    serde_json::from_value::<GraphqlError>(item.clone())
                        .map_or_else(|_| item.to_string(), |err| err.message)
                })
                .collect();
            messages.join("; ")
        }
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map_or_else(|| payload.to_string(), ToString::to_string),
        _ => payload.to_string(),
    }
}

fn decode(text: &str) -> Result<OperationMessage, SubscriptionError> {
    serde_json::from_str(text).map_err(|e| SubscriptionError::Json(e.to_string()))
}

fn require_id(id: Option<String>, message_type: &str) -> Result<String, SubscriptionError> {
    id.ok_or_else(|| SubscriptionError::Protocol {
        message: format!("{message_type} message without id"),
    })
}

/// Adapter for the current `graphql-ws` protocol.
pub struct GraphqlWsAdapter;

impl ProtocolAdapter for GraphqlWsAdapter {
    fn protocol(&self) -> WsProtocol {
        WsProtocol::GraphqlWs
    }

    fn connection_init(&self, params: Option<Value>) -> OperationMessage {
        let message = OperationMessage::new("connection_init");
        match params {
            Some(params) => message.with_payload(params),
            None => message,
        }
    }

    fn start(
        &self,
        id: &str,
        payload: &GraphqlRequestPayload,
    ) -> Result<OperationMessage, SubscriptionError> {
        Ok(OperationMessage::new("subscribe")
            .with_id(id)
            .with_payload(serde_json::to_value(payload)?))
    }

    fn stop(&self, id: &str) -> OperationMessage {
        OperationMessage::new("complete").with_id(id)
    }

    fn terminate(&self) -> Option<OperationMessage> {
        None
    }

    fn pong(&self, payload: Option<Value>) -> Option<OperationMessage> {
        let message = OperationMessage::new("pong");
        Some(match payload {
            Some(payload) => message.with_payload(payload),
            None => message,
        })
    }

    fn ping(&self) -> Option<OperationMessage> {
        Some(OperationMessage::new("ping"))
    }

    fn parse(&self, text: &str) -> Result<ProtocolEvent, SubscriptionError> {
        let OperationMessage {
            message_type,
            id,
            payload,
        } = decode(text)?;
        let event = match message_type.as_str() {
            "connection_ack" => ProtocolEvent::Ack,
            "ping" => ProtocolEvent::Ping(payload),
            "pong" => ProtocolEvent::KeepAlive,
            "next" => ProtocolEvent::Data {
                id: require_id(id, "next")?,
                payload: payload.unwrap_or(Value::Null),
            },
            "error" => ProtocolEvent::ErrorMsg {
                id,
                payload: payload.unwrap_or(Value::Null),
            },
            "complete" => ProtocolEvent::Complete {
                id: require_id(id, "complete")?,
            },
            other => ProtocolEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

/// Adapter for the legacy `subscriptions-transport-ws` protocol.
pub struct TransportWsAdapter;

impl ProtocolAdapter for TransportWsAdapter {
    fn protocol(&self) -> WsProtocol {
        WsProtocol::SubscriptionsTransportWs
    }

    fn connection_init(&self, params: Option<Value>) -> OperationMessage {
        let message = OperationMessage::new("connection_init");
        match params {
            Some(params) => message.with_payload(params),
            None => message,
        }
    }

    fn start(
        &self,
        id: &str,
        payload: &GraphqlRequestPayload,
    ) -> Result<OperationMessage, SubscriptionError> {
        Ok(OperationMessage::new("start")
            .with_id(id)
            .with_payload(serde_json::to_value(payload)?))
    }

    fn stop(&self, id: &str) -> OperationMessage {
        OperationMessage::new("stop").with_id(id)
    }

    fn terminate(&self) -> Option<OperationMessage> {
        Some(OperationMessage::new("connection_terminate"))
    }

    fn pong(&self, _payload: Option<Value>) -> Option<OperationMessage> {
        None
    }

    fn ping(&self) -> Option<OperationMessage> {
        None
    }

    fn parse(&self, text: &str) -> Result<ProtocolEvent, SubscriptionError> {
        let OperationMessage {
            message_type,
            id,
            payload,
        } = decode(text)?;
        let event = match message_type.as_str() {
            "connection_ack" => ProtocolEvent::Ack,
            "ka" => ProtocolEvent::KeepAlive,
            "connection_error" => ProtocolEvent::ErrorMsg {
                id: None,
                payload: payload.unwrap_or(Value::Null),
            },
            "data" => ProtocolEvent::Data {
                id: require_id(id, "data")?,
                payload: payload.unwrap_or(Value::Null),
            },
            "error" => ProtocolEvent::ErrorMsg {
                id,
                payload: payload.unwrap_or(Value::Null),
            },
            "complete" => ProtocolEvent::Complete {
                id: require_id(id, "complete")?,
            },
            other => ProtocolEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &OperationMessage) -> Value {
        serde_json::to_value(message).unwrap()
    }

    #[test]
    fn graphql_ws_client_messages() {
        let adapter = adapter_for(WsProtocol::GraphqlWs);

        let init = adapter.connection_init(Some(serde_json::json!({"headers": {"foo": "bar"}})));
        assert_eq!(
            encode(&init),
            serde_json::json!({
                "type": "connection_init",
                "payload": {"headers": {"foo": "bar"}}
            })
        );

        let payload = GraphqlRequestPayload::new("subscription{helloSaid{msg}}");
        let start = adapter.start("sub-1", &payload).unwrap();
        assert_eq!(
            encode(&start),
            serde_json::json!({
                "type": "subscribe",
                "id": "sub-1",
                "payload": {"query": "subscription{helloSaid{msg}}"}
            })
        );

        assert_eq!(
            encode(&adapter.stop("sub-1")),
            serde_json::json!({"type": "complete", "id": "sub-1"})
        );
        assert!(adapter.terminate().is_none());
        assert_eq!(
            encode(&adapter.ping().unwrap()),
            serde_json::json!({"type": "ping"})
        );
    }

    #[test]
    fn legacy_client_messages() {
        let adapter = adapter_for(WsProtocol::SubscriptionsTransportWs);

        let payload = GraphqlRequestPayload::new("subscription{helloSaid{msg}}");
        let start = adapter.start("sub-1", &payload).unwrap();
        assert_eq!(start.message_type, "start");

        assert_eq!(adapter.stop("sub-1").message_type, "stop");
        assert_eq!(
            adapter.terminate().unwrap().message_type,
            "connection_terminate"
        );
        assert!(adapter.pong(None).is_none());
        assert!(adapter.ping().is_none());
    }

    #[test]
    fn graphql_ws_parse_events() {
        let adapter = adapter_for(WsProtocol::GraphqlWs);

        assert!(matches!(
            adapter.parse(r#"{"type":"connection_ack"}"#).unwrap(),
            ProtocolEvent::Ack
        ));
        assert!(matches!(
            adapter.parse(r#"{"type":"pong"}"#).unwrap(),
            ProtocolEvent::KeepAlive
        ));
        assert!(matches!(
            adapter.parse(r#"{"type":"ping"}"#).unwrap(),
            ProtocolEvent::Ping(None)
        ));

        let data = adapter
            .parse(r#"{"type":"next","id":"1","payload":{"data":{"greetings":"hi"}}}"#)
            .unwrap();
        match data {
            ProtocolEvent::Data { id, payload } => {
                assert_eq!(id, "1");
                assert_eq!(payload["data"]["greetings"], "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(matches!(
            adapter.parse(r#"{"type":"complete","id":"1"}"#).unwrap(),
            ProtocolEvent::Complete { .. }
        ));
        assert!(matches!(
            adapter.parse(r#"{"type":"mystery"}"#).unwrap(),
            ProtocolEvent::Unknown(_)
        ));
        assert!(adapter.parse(r#"{"type":"next"}"#).is_err());
        assert!(adapter.parse("not json").is_err());
    }

    #[test]
    fn legacy_parse_events() {
        let adapter = adapter_for(WsProtocol::SubscriptionsTransportWs);

        assert!(matches!(
            adapter.parse(r#"{"type":"ka"}"#).unwrap(),
            ProtocolEvent::KeepAlive
        ));

        let err = adapter
            .parse(r#"{"type":"connection_error","payload":"unauthorized"}"#)
            .unwrap();
        match err {
            ProtocolEvent::ErrorMsg { id, payload } => {
                assert_eq!(id, None);
                assert_eq!(normalize_error_payload(&payload), "unauthorized");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let data = adapter
            .parse(r#"{"type":"data","id":"k1","payload":{"data":{"helloSaid":{"msg":"X"}}}}"#)
            .unwrap();
        assert!(matches!(data, ProtocolEvent::Data { .. }));
    }

    #[test]
    fn error_payload_normalization() {
        assert_eq!(
            normalize_error_payload(&serde_json::json!("plain message")),
            "plain message"
        );
        assert_eq!(
            normalize_error_payload(&serde_json::json!({"message": "object message"})),
            "object message"
        );
        assert_eq!(
            normalize_error_payload(&serde_json::json!([
                {"message": "first"},
                {"message": "second"}
            ])),
            "first; second"
        );
        assert_eq!(normalize_error_payload(&serde_json::json!(42)), "42");
    }

    #[test]
    fn subprotocol_names() {
        assert_eq!(WsProtocol::GraphqlWs.subprotocol(), "graphql-transport-ws");
        assert_eq!(
            WsProtocol::SubscriptionsTransportWs.subprotocol(),
            "graphql-ws"
        );
    }
}
