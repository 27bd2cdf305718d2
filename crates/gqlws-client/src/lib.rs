//! Protocol-dual GraphQL-over-WebSocket subscription client.
//!
//! This crate provides:
//! - A subscription engine with ack gating, keepalive watchdogs, and
//!   automatic reconnection with backoff.
//! - Two interoperable sub-protocols (`graphql-ws` and the legacy
//!   `subscriptions-transport-ws`) behind one adapter contract.
//! - A registry of subscriptions keyed by client-stable keys that survive
//!   any number of reconnections.
//! - Selective retry by WebSocket close code.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gqlws_client::{GraphqlRequestPayload, SubscriptionClient};
//!
//! let client = SubscriptionClient::new("wss://api.example.com/graphql");
//! let key = client.subscribe_raw(
//!     GraphqlRequestPayload::new("subscription{helloSaid{msg}}"),
//!     |result| {
//!         println!("payload: {:?}", result?);
//!         Ok(())
//!     },
//! );
//! client.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod client;
mod dispatch;
mod error;
mod operation;
mod protocol;
mod registry;
mod retry;

pub use client::{LogCategory, SubscriptionClient};
pub use dispatch::DispatchMode;
pub use error::{GraphqlError, GraphqlErrorLocation, SubscriptionError};
pub use operation::{GraphqlOperation, GraphqlRequestPayload, GraphqlResponse};
pub use protocol::{OperationMessage, ProtocolAdapter, ProtocolEvent, WsProtocol, adapter_for};
pub use registry::{HandlerError, SubscriptionHandler, SubscriptionSnapshot, SubscriptionStatus};
pub use retry::{RetryClassifier, parse_int_ranges};

pub use gqlws_streaming::{ReconnectConfig, StreamError, WsConfig};
