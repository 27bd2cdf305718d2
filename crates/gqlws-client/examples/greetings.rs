//! Minimal subscription demo against a local GraphQL server.
//!
//! Pass `ws` as the first argument to use the legacy
//! `subscriptions-transport-ws` protocol instead of `graphql-ws`.

use gqlws_client::{GraphqlRequestPayload, LogCategory, SubscriptionClient, WsProtocol};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let protocol = match std::env::args().nth(1).as_deref() {
        Some("ws") => WsProtocol::SubscriptionsTransportWs,
        _ => WsProtocol::GraphqlWs,
    };

    let client = SubscriptionClient::new("http://localhost:4000/graphql")
        .with_protocol(protocol)
        .with_header("Authorization", "Bearer random-secret")
        .without_log_categories([LogCategory::Data, LogCategory::KeepAlive])
        .on_error(|err| {
            eprintln!("connection error: {err}");
            Some(err)
        });

    client.subscribe_raw(
        GraphqlRequestPayload::new("subscription{greetings}"),
        |result| {
            match result {
                Ok(bytes) => println!("greeting: {}", String::from_utf8_lossy(&bytes)),
                Err(err) => eprintln!("subscription error: {err}"),
            }
            Ok(())
        },
    );

    client.run().await?;
    Ok(())
}
