//! WebSocket transport for GraphQL subscription clients.
//!
//! This crate provides the framed, full-duplex byte channel the subscription
//! engine is built on:
//!
//! - **WebSocket**: connection setup with custom upgrade headers, text/binary
//!   framing, close-code reporting
//! - **Reconnection**: configurable exponential backoff with jitter
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gqlws_streaming::{WsClient, WsMessage};
//!
//! let client = WsClient::new("wss://api.example.com/graphql");
//! let mut conn = client.connect().await?;
//! conn.send_text("{\"type\":\"connection_init\"}").await?;
//! while let Some(message) = conn.recv().await? {
//!     println!("frame: {:?}", message);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod reconnect;
mod websocket;

pub use error::*;
pub use reconnect::*;
pub use websocket::*;

use std::time::Duration;

/// Default delay before the first reconnection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Maximum delay between reconnection attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
