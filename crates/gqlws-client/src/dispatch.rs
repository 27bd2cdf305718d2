//! Handler dispatch.
//!
//! Handlers never run on the engine task. Each dispatcher worker pulls items
//! off an unbounded queue, re-checks the subscription's status, and invokes
//! the handler outside the registry lock. A handler returning an error is
//! forwarded to the engine as a shutdown request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::EngineCommand;
use crate::error::SubscriptionError;
use crate::registry::SubscriptionRegistry;

/// Handler dispatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Per-subscription FIFO; handlers of different subscriptions may run
    /// concurrently.
    #[default]
    Parallel,
    /// One global FIFO; handlers never interleave, in message arrival order.
    Sequential,
}

type DispatchItem = (String, Result<Vec<u8>, SubscriptionError>);

/// Routes decoded events to handler workers for one connection.
pub(crate) struct Dispatcher {
    mode: DispatchMode,
    registry: Arc<SubscriptionRegistry>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    shared: Option<mpsc::UnboundedSender<DispatchItem>>,
    per_key: HashMap<String, mpsc::UnboundedSender<DispatchItem>>,
}

impl Dispatcher {
    pub fn new(
        mode: DispatchMode,
        registry: Arc<SubscriptionRegistry>,
        commands: mpsc::UnboundedSender<EngineCommand>,
    ) -> Self {
        Self {
            mode,
            registry,
            commands,
            shared: None,
            per_key: HashMap::new(),
        }
    }

    /// Enqueue one result for a subscription key.
    pub fn dispatch(&mut self, key: String, item: Result<Vec<u8>, SubscriptionError>) {
        match self.mode {
            DispatchMode::Sequential => {
                if self.shared.is_none() {
                    let worker = self.spawn_worker();
                    self.shared = Some(worker);
                }
                if let Some(sender) = &self.shared {
                    let _ = sender.send((key, item));
                }
            }
            DispatchMode::Parallel => {
                if !self.per_key.contains_key(&key) {
                    let worker = self.spawn_worker();
                    self.per_key.insert(key.clone(), worker);
                }
                if let Some(sender) = self.per_key.get(&key) {
                    let _ = sender.send((key, item));
                }
            }
        }
    }

    /// Drop the queue of a terminated subscription; its worker drains and
    /// exits.
    pub fn forget(&mut self, key: &str) {
        self.per_key.remove(key);
    }

    fn spawn_worker(&self) -> mpsc::UnboundedSender<DispatchItem> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchItem>();
        let registry = Arc::clone(&self.registry);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some((key, item)) = rx.recv().await {
                // Re-check under the current registry state so nothing is
                // delivered after a terminal transition.
                let Some(handler) = registry.running_handler(&key) else {
                    continue;
                };
                if let Err(err) = handler(item) {
                    let _ = commands.send(EngineCommand::HandlerExit(err.to_string()));
                    break;
                }
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::operation::GraphqlRequestPayload;
    use crate::registry::SubscriptionStatus;

    fn registry_with_running(
        handler: crate::registry::SubscriptionHandler,
    ) -> (Arc<SubscriptionRegistry>, String) {
        let registry = Arc::new(SubscriptionRegistry::default());
        let key = registry.register(GraphqlRequestPayload::new("subscription{tick}"), handler);
        registry.set_status(&key, SubscriptionStatus::Running);
        (registry, key)
    }

    #[tokio::test]
    async fn delivers_in_arrival_order_per_key() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let (registry, key) = registry_with_running(Arc::new(move |item| {
            seen_clone.lock().push(item.unwrap());
            Ok(())
        }));

        let (commands, _command_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(DispatchMode::Parallel, registry, commands);
        for n in 0..4u8 {
            dispatcher.dispatch(key.clone(), Ok(vec![n]));
        }
        drop(dispatcher);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn handler_error_reaches_engine() {
        let (registry, key) = registry_with_running(Arc::new(|_| Err("exit".into())));

        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(DispatchMode::Sequential, registry, commands);
        dispatcher.dispatch(key, Ok(b"{}".to_vec()));

        let command = command_rx.recv().await;
        match command {
            Some(EngineCommand::HandlerExit(message)) => assert_eq!(message, "exit"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn skips_subscriptions_no_longer_running() {
        let invoked = Arc::new(Mutex::new(0u32));
        let invoked_clone = Arc::clone(&invoked);
        let (registry, key) = registry_with_running(Arc::new(move |_| {
            *invoked_clone.lock() += 1;
            Ok(())
        }));
        registry.set_status(&key, SubscriptionStatus::Waiting);

        let (commands, _command_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(DispatchMode::Parallel, registry, commands);
        dispatcher.dispatch(key, Ok(b"{}".to_vec()));
        drop(dispatcher);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*invoked.lock(), 0);
    }
}
