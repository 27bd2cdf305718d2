//! WebSocket client implementation.
//!
//! Wraps `tokio-tungstenite` behind a message model that reports close codes,
//! so callers can decide whether a teardown is worth retrying.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use url::Url;

use crate::{StreamError, StreamResult};

/// WebSocket message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Ping message.
    Ping(Vec<u8>),
    /// Pong message.
    Pong(Vec<u8>),
    /// Close message.
    Close(Option<WsCloseFrame>),
}

impl WsMessage {
    /// Create a text message.
    #[must_use]
    pub fn text(data: impl Into<String>) -> Self {
        Self::Text(data.into())
    }

    /// Check if this is a close message.
    #[must_use]
    pub const fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Get text data if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.to_string()),
            Message::Binary(b) => Self::Binary(b.to_vec()),
            Message::Ping(b) => Self::Ping(b.to_vec()),
            Message::Pong(b) => Self::Pong(b.to_vec()),
            Message::Close(frame) => Self::Close(frame.map(|f| WsCloseFrame {
                code: f.code.into(),
                reason: f.reason.to_string(),
            })),
            Message::Frame(_) => Self::Binary(vec![]),
        }
    }
}

impl From<WsMessage> for Message {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(s) => Self::Text(s),
            WsMessage::Binary(b) => Self::Binary(b),
            WsMessage::Ping(b) => Self::Ping(b),
            WsMessage::Pong(b) => Self::Pong(b),
            WsMessage::Close(frame) => {
                use tokio_tungstenite::tungstenite::protocol::CloseFrame;
                use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
                Self::Close(frame.map(|f| CloseFrame {
                    code: CloseCode::from(f.code),
                    reason: f.reason.into(),
                }))
            }
        }
    }
}

/// WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsCloseFrame {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl WsCloseFrame {
    /// Create a new close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(1000, "Normal closure")
    }

    /// Convert into the error reported for a remote close.
    #[must_use]
    pub fn into_error(self) -> StreamError {
        StreamError::ConnectionClosed {
            reason: self.reason,
            code: Some(self.code),
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum message size.
    pub max_message_size: usize,
    /// Additional headers attached to the upgrade request.
    pub headers: HashMap<String, String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_message_size: 16 * 1024 * 1024,
            headers: HashMap::new(),
        }
    }
}

impl WsConfig {
    /// Create new configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Add a header to the upgrade request.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// WebSocket client.
pub struct WsClient {
    url: String,
    config: WsConfig,
}

impl WsClient {
    /// Create a new WebSocket client.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: WsConfig::default(),
        }
    }

    /// Create with configuration.
    #[must_use]
    pub fn with_config(url: impl Into<String>, config: WsConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    /// Connect to the WebSocket server.
    ///
    /// The configured headers are attached to the HTTP upgrade request.
    ///
    /// # Errors
    /// Returns an error if the URL or headers are invalid, or if the
    /// connection attempt fails or times out.
    pub async fn connect(&self) -> StreamResult<WsConnection> {
        let url = Url::parse(&self.url)
            .map_err(|e: url::ParseError| StreamError::ConnectionFailed(e.to_string()))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
        for (key, value) in &self.config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| StreamError::ConnectionFailed(format!("invalid header {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StreamError::ConnectionFailed(format!("invalid header {key}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let connect_result = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await;

        let Ok(ws_result) = connect_result else {
            return Err(StreamError::Timeout(self.config.connect_timeout));
        };

        let (ws_stream, _response) =
            ws_result.map_err(|e: tokio_tungstenite::tungstenite::Error| {
                StreamError::WebSocketError(e.to_string())
            })?;

        Ok(WsConnection::new(ws_stream))
    }

    /// Get the URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &WsConfig {
        &self.config
    }
}

/// Active WebSocket connection.
pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    closed: bool,
}

impl WsConnection {
    const fn new(stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>) -> Self {
        Self {
            inner: stream,
            closed: false,
        }
    }

    /// Send a message.
    ///
    /// # Errors
    /// Returns a transport error if the message cannot be sent.
    pub async fn send(&mut self, message: WsMessage) -> StreamResult<()> {
        if self.closed {
            return Err(StreamError::InvalidState("Connection is closed".into()));
        }

        self.inner
            .send(message.into())
            .await
            .map_err(|e| StreamError::WebSocketError(e.to_string()))
    }

    /// Send a text message.
    ///
    /// # Errors
    /// Returns a transport error if the message cannot be sent.
    pub async fn send_text(&mut self, text: impl Into<String>) -> StreamResult<()> {
        self.send(WsMessage::text(text)).await
    }

    /// Send JSON data.
    ///
    /// # Errors
    /// Returns a transport error if serialization or send fails.
    pub async fn send_json<T: serde::Serialize + Sync>(&mut self, data: &T) -> StreamResult<()> {
        let json =
            serde_json::to_string(data).map_err(|e| StreamError::ParseError(e.to_string()))?;
        self.send_text(json).await
    }

    /// Receive the next message.
    ///
    /// A `Close` frame from the peer is returned as a message so the caller
    /// can inspect the close code; subsequent calls return `Ok(None)`.
    ///
    /// # Errors
    /// Returns a transport error if the underlying socket fails.
    pub async fn recv(&mut self) -> StreamResult<Option<WsMessage>> {
        if self.closed {
            return Ok(None);
        }

        match self.inner.next().await {
            Some(Ok(msg)) => {
                let ws_msg: WsMessage = msg.into();
                if ws_msg.is_close() {
                    self.closed = true;
                }
                Ok(Some(ws_msg))
            }
            Some(Err(e)) => {
                self.closed = true;
                Err(StreamError::WebSocketError(e.to_string()))
            }
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    /// Close the connection.
    ///
    /// # Errors
    /// Returns a transport error if the close frame fails to send.
    pub async fn close(&mut self) -> StreamResult<()> {
        if !self.closed {
            self.closed = true;
            self.inner
                .close(None)
                .await
                .map_err(|e| StreamError::WebSocketError(e.to_string()))?;
        }
        Ok(())
    }

    /// Close with a specific frame.
    ///
    /// # Errors
    /// Returns a transport error if the close frame fails to send.
    pub async fn close_with_frame(&mut self, frame: WsCloseFrame) -> StreamResult<()> {
        if !self.closed {
            self.closed = true;
            self.inner
                .send(WsMessage::Close(Some(frame)).into())
                .await
                .map_err(|e| StreamError::WebSocketError(e.to_string()))?;
        }
        Ok(())
    }

    /// Check if the connection is closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Split into independently owned write and read halves.
    ///
    /// Used by callers that select over reads while writing from the same
    /// task, such as a protocol run loop.
    #[must_use]
    pub fn split(self) -> (WsSink, WsSource) {
        let (sink, stream) = self.inner.split();
        (WsSink { inner: sink }, WsSource { inner: stream })
    }
}

/// Write half of a split connection.
pub struct WsSink {
    inner: SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>,
}

impl WsSink {
    /// Send a message.
    ///
    /// # Errors
    /// Returns a transport error if the message cannot be sent.
    pub async fn send(&mut self, message: WsMessage) -> StreamResult<()> {
        self.inner
            .send(message.into())
            .await
            .map_err(|e| StreamError::WebSocketError(e.to_string()))
    }

    /// Send JSON data.
    ///
    /// # Errors
    /// Returns a transport error if serialization or send fails.
    pub async fn send_json<T: serde::Serialize + Sync>(&mut self, data: &T) -> StreamResult<()> {
        let json =
            serde_json::to_string(data).map_err(|e| StreamError::ParseError(e.to_string()))?;
        self.send(WsMessage::Text(json)).await
    }

    /// Send a close frame.
    ///
    /// # Errors
    /// Returns a transport error if the close frame fails to send.
    pub async fn close_with_frame(&mut self, frame: WsCloseFrame) -> StreamResult<()> {
        self.send(WsMessage::Close(Some(frame))).await
    }
}

/// Read half of a split connection.
pub struct WsSource {
    inner: SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>,
}

impl WsSource {
    /// Receive the next message, `None` when the stream is exhausted.
    ///
    /// # Errors
    /// Returns a transport error if the underlying socket fails.
    pub async fn recv(&mut self) -> StreamResult<Option<WsMessage>> {
        match self.inner.next().await {
            Some(Ok(msg)) => Ok(Some(msg.into())),
            Some(Err(e)) => Err(StreamError::WebSocketError(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_message_text() {
        let msg = WsMessage::text("hello");
        assert_eq!(msg.as_text(), Some("hello"));
        assert!(!msg.is_close());
    }

    #[test]
    fn ws_close_frame_into_error() {
        let err = WsCloseFrame::new(4400, "bad request").into_error();
        assert_eq!(err.close_status(), Some(4400));

        let other = StreamError::ConnectionFailed("dial".into());
        assert_eq!(other.close_status(), None);
    }

    #[test]
    fn ws_close_frame_normal() {
        let frame = WsCloseFrame::normal();
        assert_eq!(frame.code, 1000);
    }

    #[test]
    fn ws_config_builders() {
        let config = WsConfig::new()
            .with_connect_timeout(Duration::from_secs(60))
            .with_max_message_size(1024)
            .with_header("Authorization", "Bearer token");

        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(
            config.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
    }
}
