//! Subscription client engine.
//!
//! One `run` invocation owns the connection lifecycle end to end: dial, init,
//! ack gating, start emission, frame dispatch, keepalive watchdog, reconnect
//! with backoff, graceful shutdown. Public methods never touch the socket;
//! they enqueue commands the engine loop consumes, so there is exactly one
//! writer per connection.

use std::collections::HashSet;
use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at, sleep_until};
use tracing::{debug, info, warn};
use url::Url;

use gqlws_streaming::{
    ReconnectConfig, ReconnectHandler, StreamError, WsClient, WsCloseFrame, WsConfig, WsConnection,
    WsMessage, WsSink,
};

use crate::dispatch::{DispatchMode, Dispatcher};
use crate::error::SubscriptionError;
use crate::operation::{GraphqlOperation, GraphqlRequestPayload, GraphqlResultPayload};
use crate::protocol::{
    ProtocolAdapter, ProtocolEvent, WsProtocol, adapter_for, normalize_error_payload,
};
use crate::registry::{
    HandlerError, SubscriptionRegistry, SubscriptionSnapshot, SubscriptionStatus,
};
use crate::retry::RetryClassifier;

/// Budget for best-effort terminate/close frames during graceful shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Default time to wait for `connection_ack`.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Log chatter categories that can be silenced per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Connection lifecycle events.
    Connection,
    /// Outgoing protocol messages.
    Send,
    /// Incoming data frames.
    Data,
    /// Keepalive traffic.
    KeepAlive,
}

type ConnectedHook = Arc<dyn Fn() + Send + Sync>;
type DisconnectedHook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(SubscriptionError) -> Option<SubscriptionError> + Send + Sync>;
type CompleteHook = Arc<dyn Fn(SubscriptionSnapshot) + Send + Sync>;

#[derive(Clone)]
struct ClientConfig {
    url: String,
    protocol: WsProtocol,
    connection_params: Option<Value>,
    ws: WsConfig,
    ack_timeout: Duration,
    keepalive_timeout: Option<Duration>,
    reconnect: ReconnectConfig,
    retry_status_codes: Vec<String>,
    exit_when_no_subscription: bool,
    dispatch_mode: DispatchMode,
    disabled_logs: HashSet<LogCategory>,
    on_connected: Option<ConnectedHook>,
    on_disconnected: Option<DisconnectedHook>,
    on_error: Option<ErrorHook>,
    on_subscription_complete: Option<CompleteHook>,
}

impl ClientConfig {
    fn new(url: String) -> Self {
        Self {
            url,
            protocol: WsProtocol::default(),
            connection_params: None,
            ws: WsConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            keepalive_timeout: None,
            reconnect: ReconnectConfig::default(),
            retry_status_codes: Vec::new(),
            exit_when_no_subscription: true,
            dispatch_mode: DispatchMode::default(),
            disabled_logs: HashSet::new(),
            on_connected: None,
            on_disconnected: None,
            on_error: None,
            on_subscription_complete: None,
        }
    }

    fn log_enabled(&self, category: LogCategory) -> bool {
        !self.disabled_logs.contains(&category)
    }
}

#[derive(Debug)]
pub(crate) enum EngineCommand {
    Start(String),
    Stop(String),
    HandlerExit(String),
    Close,
}

enum ServeOutcome {
    /// Shutdown requested by the user.
    Closed,
    /// The last subscription finished and `exit_when_no_subscription` is on.
    Drained,
    /// A data handler returned an error.
    HandlerExit(String),
    /// Connection-scoped server error; hooks decide whether it is fatal.
    ServerError(SubscriptionError),
    /// Transport teardown; the classifier decides whether to reconnect.
    Disconnected(SubscriptionError),
}

enum BackoffOutcome {
    Continue,
    Shutdown,
    Exhausted(SubscriptionError),
}

enum RawFrame {
    Text(String),
    Ping(Vec<u8>),
    Ignored,
    Closed(SubscriptionError),
}

struct ClientInner {
    config: Mutex<ClientConfig>,
    registry: Arc<SubscriptionRegistry>,
    commands: Mutex<Option<mpsc::UnboundedSender<EngineCommand>>>,
    shutdown: watch::Sender<bool>,
    state: watch::Sender<bool>,
    acked: AtomicBool,
}

/// Protocol-dual GraphQL-over-WebSocket subscription client.
///
/// Cheap to clone; clones share the registry and the running engine.
#[derive(Clone)]
pub struct SubscriptionClient {
    inner: Arc<ClientInner>,
}

impl SubscriptionClient {
    /// Create a client for an endpoint.
    ///
    /// `http`/`https` endpoints are accepted and dialed as `ws`/`wss`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config: Mutex::new(ClientConfig::new(url.into())),
                registry: Arc::new(SubscriptionRegistry::default()),
                commands: Mutex::new(None),
                shutdown,
                state,
                acked: AtomicBool::new(false),
            }),
        }
    }

    /// Select the sub-protocol to speak.
    #[must_use]
    pub fn with_protocol(self, protocol: WsProtocol) -> Self {
        self.inner.config.lock().protocol = protocol;
        self
    }

    /// Set the free-form `connection_init` payload.
    #[must_use]
    pub fn with_connection_params(self, params: Value) -> Self {
        self.inner.config.lock().connection_params = Some(params);
        self
    }

    /// Replace the WebSocket options (upgrade headers, connect timeout).
    #[must_use]
    pub fn with_websocket_options(self, options: WsConfig) -> Self {
        self.inner.config.lock().ws = options;
        self
    }

    /// Add a header to the upgrade request.
    #[must_use]
    pub fn with_header(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner
            .config
            .lock()
            .ws
            .headers
            .insert(key.into(), value.into());
        self
    }

    /// Set how long to wait for `connection_ack`.
    #[must_use]
    pub fn with_ack_timeout(self, timeout: Duration) -> Self {
        self.inner.config.lock().ack_timeout = timeout;
        self
    }

    /// Treat the connection as dead when no keepalive arrives within
    /// `timeout`. Also paces client pings on protocols that have them.
    #[must_use]
    pub fn with_keepalive_timeout(self, timeout: Duration) -> Self {
        self.inner.config.lock().keepalive_timeout = Some(timeout);
        self
    }

    /// Close codes worth reconnecting on, as range expressions such as
    /// `"4400"` or `"4400-4499"`. Validated when `run` starts.
    #[must_use]
    pub fn with_retry_status_codes<I, S>(self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.config.lock().retry_status_codes =
            codes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the reconnect backoff policy.
    #[must_use]
    pub fn with_reconnect(self, reconnect: ReconnectConfig) -> Self {
        self.inner.config.lock().reconnect = reconnect;
        self
    }

    /// Keep `run` alive even when the registry is empty (default exits).
    #[must_use]
    pub fn with_exit_when_no_subscription(self, exit: bool) -> Self {
        self.inner.config.lock().exit_when_no_subscription = exit;
        self
    }

    /// Select the handler dispatch policy.
    #[must_use]
    pub fn with_dispatch_mode(self, mode: DispatchMode) -> Self {
        self.inner.config.lock().dispatch_mode = mode;
        self
    }

    /// Silence the given log categories.
    #[must_use]
    pub fn without_log_categories(self, categories: impl IntoIterator<Item = LogCategory>) -> Self {
        self.inner.config.lock().disabled_logs.extend(categories);
        self
    }

    /// Invoked after each successful `connection_ack`.
    #[must_use]
    pub fn on_connected(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.inner.config.lock().on_connected = Some(Arc::new(hook));
        self
    }

    /// Invoked on every connection teardown, graceful or not.
    #[must_use]
    pub fn on_disconnected(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.inner.config.lock().on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Invoked for non-retryable errors. Returning `Some` makes `run` return
    /// that error; returning `None` swallows it and reconnects.
    ///
    /// Without this hook every non-retryable error ends `run`.
    #[must_use]
    pub fn on_error(
        self,
        hook: impl Fn(SubscriptionError) -> Option<SubscriptionError> + Send + Sync + 'static,
    ) -> Self {
        self.inner.config.lock().on_error = Some(Arc::new(hook));
        self
    }

    /// Invoked exactly once when a subscription reaches a terminal state.
    #[must_use]
    pub fn on_subscription_complete(
        self,
        hook: impl Fn(SubscriptionSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.inner.config.lock().on_subscription_complete = Some(Arc::new(hook));
        self
    }

    /// Register a typed subscription.
    ///
    /// Safe to call before, during, or after `run`; on a live acked
    /// connection the operation starts immediately.
    ///
    /// # Errors
    /// Returns a JSON error if the variables fail to serialize.
    pub fn subscribe<O, F>(
        &self,
        variables: O::Variables,
        handler: F,
    ) -> Result<String, SubscriptionError>
    where
        O: GraphqlOperation,
        F: Fn(Result<Vec<u8>, SubscriptionError>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let payload = GraphqlRequestPayload::from_operation::<O>(variables)?;
        Ok(self.subscribe_raw(payload, handler))
    }

    /// Register a subscription from a prebuilt payload; returns its key.
    pub fn subscribe_raw<F>(&self, payload: GraphqlRequestPayload, handler: F) -> String
    where
        F: Fn(Result<Vec<u8>, SubscriptionError>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let key = self.inner.registry.register(payload, Arc::new(handler));
        if self.inner.acked.load(Ordering::SeqCst) {
            self.send_command(EngineCommand::Start(key.clone()));
        }
        key
    }

    /// Cancel a subscription by key.
    ///
    /// A running operation gets a protocol stop message; a waiting one is
    /// dropped locally. Idempotent once the key is gone.
    ///
    /// # Errors
    /// Returns [`SubscriptionError::NotFound`] for an unknown key.
    pub fn unsubscribe(&self, key: &str) -> Result<(), SubscriptionError> {
        if self.inner.registry.snapshot(key).is_none() {
            return Err(SubscriptionError::NotFound(key.to_string()));
        }

        let engine_running = self.inner.commands.lock().is_some();
        if engine_running {
            self.send_command(EngineCommand::Stop(key.to_string()));
        } else {
            let config = self.inner.config.lock().clone();
            self.finish_subscription(key, SubscriptionStatus::Unsubscribed, &config);
        }
        Ok(())
    }

    /// Read-only snapshot of a subscription.
    #[must_use]
    pub fn subscription(&self, key: &str) -> Option<SubscriptionSnapshot> {
        self.inner.registry.snapshot(key)
    }

    /// Count subscriptions, optionally restricted to the given statuses.
    #[must_use]
    pub fn subscription_count(&self, filter: Option<&[SubscriptionStatus]>) -> usize {
        self.inner.registry.len(filter)
    }

    /// Request shutdown and wait for the run loop to exit.
    ///
    /// Idempotent; a no-op when the client is not running.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        self.send_command(EngineCommand::Close);

        let mut state = self.inner.state.subscribe();
        while *state.borrow() {
            if state.changed().await.is_err() {
                break;
            }
        }
    }

    /// Drive the connection until a terminal condition.
    ///
    /// Blocks through reconnections. Returns `Ok(())` on graceful close or
    /// when the last subscription finishes under `exit_when_no_subscription`;
    /// otherwise returns the first terminal error. Re-entrant after `close`:
    /// the registry is preserved and waiting subscriptions start again.
    ///
    /// # Errors
    /// Returns configuration errors synchronously and the first terminal
    /// connection error otherwise.
    pub async fn run(&self) -> Result<(), SubscriptionError> {
        let config = self.inner.config.lock().clone();
        let classifier = RetryClassifier::from_expressions(&config.retry_status_codes)?;
        let url = normalize_ws_url(&config.url)?;

        if self.inner.state.send_replace(true) {
            return Err(SubscriptionError::AlreadyRunning);
        }
        let _guard = RunGuard { inner: &self.inner };
        let _ = self.inner.shutdown.send_replace(false);

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        *self.inner.commands.lock() = Some(command_tx.clone());

        let adapter = adapter_for(config.protocol);
        let mut ws_config = config.ws.clone();
        ws_config
            .headers
            .entry("Sec-WebSocket-Protocol".to_string())
            .or_insert_with(|| config.protocol.subprotocol().to_string());
        let ws_client = WsClient::with_config(url, ws_config);

        let mut reconnect = ReconnectHandler::new(config.reconnect.clone());
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            eprintln!("DEBUG-LIB: dialing");
            let dial = tokio::select! {
                result = ws_client.connect() => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => return Ok(()),
            };
            if let Err(e) = &dial {
                eprintln!("DEBUG-LIB: dial error={e}");
            }

            let conn = match dial {
                Ok(conn) => conn,
                Err(err) => {
                    if config.log_enabled(LogCategory::Connection) {
                        warn!(url = %ws_client.url(), error = %err, "dial failed");
                    }
                    match self.await_backoff(&mut reconnect, &mut shutdown_rx).await {
                        BackoffOutcome::Continue => continue,
                        BackoffOutcome::Shutdown => return Ok(()),
                        BackoffOutcome::Exhausted(err) => return Err(err),
                    }
                }
            };

            reconnect.reset();
            let outcome = self
                .serve(
                    conn,
                    adapter,
                    &config,
                    &command_tx,
                    &mut command_rx,
                    &mut shutdown_rx,
                )
                .await;

            self.inner.acked.store(false, Ordering::SeqCst);
            self.inner.registry.reset_for_reconnect();
            if config.log_enabled(LogCategory::Connection) {
                info!("disconnected");
            }
            if let Some(hook) = &config.on_disconnected {
                hook();
            }

            let fatal = match outcome {
                ServeOutcome::Closed => return Ok(()),
                ServeOutcome::Drained => return Ok(()),
                ServeOutcome::HandlerExit(message) => {
                    return Err(SubscriptionError::HandlerExit(message));
                }
                ServeOutcome::ServerError(err) => Some(err),
                ServeOutcome::Disconnected(err) => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                    // Normal closure is a graceful end, not a failure.
                    if err.close_status() == Some(1000) {
                        return Ok(());
                    }
                    if classifier.is_retryable(&err) {
                        debug!(error = %err, "retryable disconnect");
                        None
                    } else {
                        Some(err)
                    }
                }
            };

            if let Some(err) = fatal {
                match self.escalate(&config, err) {
                    Some(err) => return Err(err),
                    None => debug!("error swallowed by hook, reconnecting"),
                }
            }

            match self.await_backoff(&mut reconnect, &mut shutdown_rx).await {
                BackoffOutcome::Continue => {}
                BackoffOutcome::Shutdown => return Ok(()),
                BackoffOutcome::Exhausted(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn serve(
        &self,
        conn: WsConnection,
        adapter: &'static dyn ProtocolAdapter,
        config: &ClientConfig,
        commands: &mpsc::UnboundedSender<EngineCommand>,
        command_rx: &mut mpsc::UnboundedReceiver<EngineCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> ServeOutcome {
        let (mut sink, mut source) = conn.split();

        if config.log_enabled(LogCategory::Send) {
            debug!(protocol = %adapter.protocol(), "sending connection_init");
        }
        let init = adapter.connection_init(config.connection_params.clone());
        eprintln!("DEBUG-LIB: about to send connection_init");
        if let Err(err) = sink.send_json(&init).await {
            eprintln!("DEBUG-LIB: send_json failed: {err}");
            return ServeOutcome::Disconnected(err.into());
        }
        eprintln!("DEBUG-LIB: connection_init sent");

        // Await ack; nothing starts before the server acknowledges.
        let ack_deadline = Instant::now() + config.ack_timeout;
        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    self.graceful_close(&mut sink, adapter).await;
                    return ServeOutcome::Closed;
                }
                () = sleep_until(ack_deadline) => {
                    return ServeOutcome::Disconnected(SubscriptionError::AckTimeout(
                        config.ack_timeout,
                    ));
                }
                command = command_rx.recv() => match command {
                    Some(EngineCommand::Stop(key)) => {
                        if let Err(err) = self
                            .process_stop(&mut sink, adapter, None, &key, config)
                            .await
                        {
                            return ServeOutcome::Disconnected(err);
                        }
                    }
                    Some(EngineCommand::HandlerExit(message)) => {
                        self.graceful_close(&mut sink, adapter).await;
                        return ServeOutcome::HandlerExit(message);
                    }
                    Some(EngineCommand::Close) | None => {
                        self.graceful_close(&mut sink, adapter).await;
                        return ServeOutcome::Closed;
                    }
                    // Waiting subscriptions start in bulk right after ack.
                    Some(EngineCommand::Start(_)) => {}
                },
                frame = source.recv() => {
                    let text = match classify_frame(frame) {
                        RawFrame::Text(text) => text,
                        RawFrame::Ping(payload) => {
                            let _ = sink.send(WsMessage::Pong(payload)).await;
                            continue;
                        }
                        RawFrame::Ignored => continue,
                        RawFrame::Closed(err) => return ServeOutcome::Disconnected(err),
                    };
                    match adapter.parse(&text) {
                        Ok(ProtocolEvent::Ack) => break,
                        Ok(ProtocolEvent::KeepAlive) => {}
                        Ok(ProtocolEvent::Ping(payload)) => {
                            if let Some(pong) = adapter.pong(payload) {
                                let _ = sink.send_json(&pong).await;
                            }
                        }
                        Ok(ProtocolEvent::ErrorMsg { id: None, payload }) => {
                            return ServeOutcome::ServerError(SubscriptionError::Server(
                                normalize_error_payload(&payload),
                            ));
                        }
                        Ok(ProtocolEvent::Unknown(message_type)) => {
                            warn!(%message_type, "unexpected message while waiting for ack");
                        }
                        Ok(event) => {
                            return ServeOutcome::Disconnected(SubscriptionError::Protocol {
                                message: format!(
                                    "received {} before connection_ack",
                                    event_name(&event)
                                ),
                            });
                        }
                        Err(err) => return ServeOutcome::Disconnected(err),
                    }
                }
            }
        }

        self.inner.acked.store(true, Ordering::SeqCst);
        if config.log_enabled(LogCategory::Connection) {
            info!(protocol = %adapter.protocol(), "connected");
        }
        if let Some(hook) = &config.on_connected {
            hook();
        }

        let mut dispatcher = Dispatcher::new(
            config.dispatch_mode,
            Arc::clone(&self.inner.registry),
            commands.clone(),
        );

        for snapshot in self.inner.registry.waiting() {
            if let Err(err) = self
                .start_subscription(&mut sink, adapter, &snapshot, config)
                .await
            {
                return ServeOutcome::Disconnected(err);
            }
        }
        if self.drained(config) {
            self.graceful_close(&mut sink, adapter).await;
            return ServeOutcome::Drained;
        }

        let ka_timeout = config.keepalive_timeout;
        let mut ka_deadline = ka_timeout.map(|timeout| Instant::now() + timeout);
        let mut ping_timer = if adapter.ping().is_some() {
            ka_timeout.map(|timeout| {
                let period = timeout / 2;
                interval_at(Instant::now() + period, period)
            })
        } else {
            None
        };

        loop {
            let ka_wait = async move {
                match ka_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };
            let ping_wait = async {
                match ping_timer.as_mut() {
                    Some(timer) => {
                        timer.tick().await;
                    }
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    self.graceful_close(&mut sink, adapter).await;
                    return ServeOutcome::Closed;
                }
                () = ka_wait => {
                    return ServeOutcome::Disconnected(SubscriptionError::KeepAliveTimeout(
                        ka_timeout.unwrap_or_default(),
                    ));
                }
                () = ping_wait => {
                    if let Some(ping) = adapter.ping() {
                        if config.log_enabled(LogCategory::KeepAlive) {
                            debug!("sending ping");
                        }
                        if let Err(err) = sink.send_json(&ping).await {
                            return ServeOutcome::Disconnected(err.into());
                        }
                    }
                }
                command = command_rx.recv() => match command {
                    Some(EngineCommand::Start(key)) => {
                        if let Some(snapshot) = self.inner.registry.snapshot(&key) {
                            if snapshot.status() == SubscriptionStatus::Waiting {
                                if let Err(err) = self
                                    .start_subscription(&mut sink, adapter, &snapshot, config)
                                    .await
                                {
                                    return ServeOutcome::Disconnected(err);
                                }
                            }
                        }
                    }
                    Some(EngineCommand::Stop(key)) => {
                        if let Err(err) = self
                            .process_stop(&mut sink, adapter, Some(&mut dispatcher), &key, config)
                            .await
                        {
                            return ServeOutcome::Disconnected(err);
                        }
                        if self.drained(config) {
                            self.graceful_close(&mut sink, adapter).await;
                            return ServeOutcome::Drained;
                        }
                    }
                    Some(EngineCommand::HandlerExit(message)) => {
                        self.graceful_close(&mut sink, adapter).await;
                        return ServeOutcome::HandlerExit(message);
                    }
                    Some(EngineCommand::Close) | None => {
                        self.graceful_close(&mut sink, adapter).await;
                        return ServeOutcome::Closed;
                    }
                },
                frame = source.recv() => {
                    let text = match classify_frame(frame) {
                        RawFrame::Text(text) => text,
                        RawFrame::Ping(payload) => {
                            let _ = sink.send(WsMessage::Pong(payload)).await;
                            continue;
                        }
                        RawFrame::Ignored => continue,
                        RawFrame::Closed(err) => return ServeOutcome::Disconnected(err),
                    };
                    let event = match adapter.parse(&text) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, "failed to decode frame");
                            continue;
                        }
                    };
                    match event {
                        ProtocolEvent::Ack => {}
                        ProtocolEvent::KeepAlive => {
                            if config.log_enabled(LogCategory::KeepAlive) {
                                debug!("keepalive");
                            }
                            ka_deadline = ka_timeout.map(|timeout| Instant::now() + timeout);
                        }
                        ProtocolEvent::Ping(payload) => {
                            ka_deadline = ka_timeout.map(|timeout| Instant::now() + timeout);
                            if let Some(pong) = adapter.pong(payload) {
                                if let Err(err) = sink.send_json(&pong).await {
                                    return ServeOutcome::Disconnected(err.into());
                                }
                            }
                        }
                        ProtocolEvent::Data { id, payload } => {
                            self.handle_data(&mut dispatcher, &id, payload, config);
                        }
                        ProtocolEvent::ErrorMsg { id: Some(id), payload } => {
                            if let Some(key) = self.inner.registry.key_for_id(&id) {
                                dispatcher.dispatch(
                                    key,
                                    Err(SubscriptionError::Server(normalize_error_payload(
                                        &payload,
                                    ))),
                                );
                            }
                        }
                        ProtocolEvent::ErrorMsg { id: None, payload } => {
                            return ServeOutcome::ServerError(SubscriptionError::Server(
                                normalize_error_payload(&payload),
                            ));
                        }
                        ProtocolEvent::Complete { id } => {
                            if let Some(key) = self.inner.registry.key_for_id(&id) {
                                dispatcher.forget(&key);
                                self.finish_subscription(
                                    &key,
                                    SubscriptionStatus::Completed,
                                    config,
                                );
                                if self.drained(config) {
                                    self.graceful_close(&mut sink, adapter).await;
                                    return ServeOutcome::Drained;
                                }
                            }
                        }
                        ProtocolEvent::Unknown(message_type) => {
                            warn!(%message_type, "unknown message type");
                        }
                    }
                }
            }
        }
    }

    fn handle_data(
        &self,
        dispatcher: &mut Dispatcher,
        id: &str,
        payload: Value,
        config: &ClientConfig,
    ) {
        let Some(key) = self.inner.registry.key_for_id(id) else {
            debug!(%id, "data for unknown subscription id");
            return;
        };
        if config.log_enabled(LogCategory::Data) {
            debug!(%id, "received data");
        }
        match serde_json::from_value::<GraphqlResultPayload>(payload) {
            Ok(result) => {
                if result.errors.is_empty() {
                    let data = result.data.unwrap_or(Value::Null);
                    match serde_json::to_vec(&data) {
                        Ok(bytes) => dispatcher.dispatch(key, Ok(bytes)),
                        Err(err) => dispatcher.dispatch(key, Err(err.into())),
                    }
                } else {
                    let message = result
                        .errors
                        .iter()
                        .map(|err| err.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    dispatcher.dispatch(key, Err(SubscriptionError::Server(message)));
                }
            }
            Err(err) => dispatcher.dispatch(key, Err(err.into())),
        }
    }

    async fn start_subscription(
        &self,
        sink: &mut WsSink,
        adapter: &'static dyn ProtocolAdapter,
        snapshot: &SubscriptionSnapshot,
        config: &ClientConfig,
    ) -> Result<(), SubscriptionError> {
        let message = adapter.start(snapshot.id(), snapshot.payload())?;
        if config.log_enabled(LogCategory::Send) {
            debug!(id = %snapshot.id(), "starting subscription");
        }
        sink.send_json(&message).await?;
        self.inner
            .registry
            .set_status(snapshot.key(), SubscriptionStatus::Running);
        Ok(())
    }

    async fn process_stop(
        &self,
        sink: &mut WsSink,
        adapter: &'static dyn ProtocolAdapter,
        dispatcher: Option<&mut Dispatcher>,
        key: &str,
        config: &ClientConfig,
    ) -> Result<(), SubscriptionError> {
        let Some(snapshot) = self.inner.registry.snapshot(key) else {
            return Ok(());
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.forget(key);
        }
        let was_running = snapshot.status() == SubscriptionStatus::Running;
        self.finish_subscription(key, SubscriptionStatus::Unsubscribed, config);
        if was_running {
            if config.log_enabled(LogCategory::Send) {
                debug!(id = %snapshot.id(), "stopping subscription");
            }
            let message = adapter.stop(snapshot.id());
            sink.send_json(&message).await?;
        }
        Ok(())
    }

    /// Terminal transition: mark, deliver the completion hook, then remove.
    fn finish_subscription(&self, key: &str, status: SubscriptionStatus, config: &ClientConfig) {
        self.inner.registry.set_status(key, status);
        if let Some(snapshot) = self.inner.registry.snapshot(key) {
            if let Some(hook) = &config.on_subscription_complete {
                hook(snapshot);
            }
        }
        self.inner.registry.remove(key);
    }

    fn drained(&self, config: &ClientConfig) -> bool {
        config.exit_when_no_subscription && self.inner.registry.len(None) == 0
    }

    async fn graceful_close(&self, sink: &mut WsSink, adapter: &'static dyn ProtocolAdapter) {
        if let Some(message) = adapter.terminate() {
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.send_json(&message)).await;
        }
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close_with_frame(WsCloseFrame::normal()))
            .await;
    }

    fn escalate(&self, config: &ClientConfig, err: SubscriptionError) -> Option<SubscriptionError> {
        match &config.on_error {
            Some(hook) => hook(err),
            None => Some(err),
        }
    }

    async fn await_backoff(
        &self,
        reconnect: &mut ReconnectHandler,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> BackoffOutcome {
        tokio::select! {
            result = reconnect.wait_for_reconnect() => match result {
                Ok(()) => BackoffOutcome::Continue,
                Err(err) => BackoffOutcome::Exhausted(err.into()),
            },
            _ = wait_for_shutdown(shutdown_rx) => BackoffOutcome::Shutdown,
        }
    }

    fn send_command(&self, command: EngineCommand) {
        if let Some(sender) = self.inner.commands.lock().as_ref() {
            let _ = sender.send(command);
        }
    }
}

struct RunGuard<'a> {
    inner: &'a ClientInner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.inner.commands.lock() = None;
        self.inner.acked.store(false, Ordering::SeqCst);
        let _ = self.inner.state.send_replace(false);
    }
}

/// Resolves once `flag` becomes `true`, without holding a non-`Send`
/// `watch::Ref` across an `.await` (as `Receiver::wait_for` would).
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

fn classify_frame(frame: gqlws_streaming::StreamResult<Option<WsMessage>>) -> RawFrame {
    match frame {
        Ok(Some(WsMessage::Text(text))) => RawFrame::Text(text),
        Ok(Some(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => RawFrame::Text(text),
            Err(_) => RawFrame::Ignored,
        },
        Ok(Some(WsMessage::Ping(payload))) => RawFrame::Ping(payload),
        Ok(Some(WsMessage::Pong(_))) => RawFrame::Ignored,
        Ok(Some(WsMessage::Close(frame))) => RawFrame::Closed(close_error(frame)),
        Ok(None) => RawFrame::Closed(close_error(None)),
        Err(err) => RawFrame::Closed(err.into()),
    }
}

fn close_error(frame: Option<WsCloseFrame>) -> SubscriptionError {
    frame
        .map_or_else(
            || StreamError::ConnectionClosed {
                reason: "connection closed without close frame".to_string(),
                code: None,
            },
            WsCloseFrame::into_error,
        )
        .into()
}

fn event_name(event: &ProtocolEvent) -> &'static str {
    match event {
        ProtocolEvent::Ack => "connection_ack",
        ProtocolEvent::KeepAlive => "keepalive",
        ProtocolEvent::Ping(_) => "ping",
        ProtocolEvent::Data { .. } => "data",
        ProtocolEvent::ErrorMsg { .. } => "error",
        ProtocolEvent::Complete { .. } => "complete",
        ProtocolEvent::Unknown(_) => "unknown",
    }
}

fn normalize_ws_url(raw: &str) -> Result<String, SubscriptionError> {
    let mut url = Url::parse(raw).map_err(|e| {
        SubscriptionError::from(StreamError::ConnectionFailed(format!(
            "invalid endpoint {raw}: {e}"
        )))
    })?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(StreamError::ConnectionFailed(format!(
                "unsupported endpoint scheme: {other}"
            ))
            .into());
        }
    };
    if let Some(scheme) = scheme {
        if url.set_scheme(scheme).is_err() {
            return Err(StreamError::ConnectionFailed(format!(
                "cannot dial {raw} over websocket"
            ))
            .into());
        }
    }
    Ok(url.into())
}
