//! Subscription registry.
//!
//! Tracks every subscription by its client-stable key. The key never changes;
//! the per-connection id starts out equal to the key and is regenerated
//! whenever the connection is torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::SubscriptionError;
use crate::operation::GraphqlRequestPayload;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Registered, waiting for an acked connection to start on.
    Waiting,
    /// Started on the current connection.
    Running,
    /// Locally cancelled.
    Unsubscribed,
    /// Finished by the server.
    Completed,
}

/// Error type a data handler may return to request engine shutdown.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback receiving raw result bytes or a subscription-scoped error.
///
/// Returning `Err` asks the engine to shut down; `run` then returns an error
/// reproducing the handler's message.
pub type SubscriptionHandler =
    Arc<dyn Fn(Result<Vec<u8>, SubscriptionError>) -> Result<(), HandlerError> + Send + Sync>;

/// Read-only view of a subscription.
#[derive(Clone)]
pub struct SubscriptionSnapshot {
    key: String,
    id: String,
    status: SubscriptionStatus,
    payload: GraphqlRequestPayload,
}

impl SubscriptionSnapshot {
    /// Client-stable key, constant across reconnections.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Per-connection id exchanged with the server.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> SubscriptionStatus {
        self.status
    }

    /// Operation payload.
    #[must_use]
    pub const fn payload(&self) -> &GraphqlRequestPayload {
        &self.payload
    }
}

impl fmt::Debug for SubscriptionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSnapshot")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("query", &self.payload.query)
            .finish()
    }
}

struct SubscriptionRecord {
    key: String,
    id: String,
    status: SubscriptionStatus,
    payload: GraphqlRequestPayload,
    handler: SubscriptionHandler,
}

impl SubscriptionRecord {
    fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            key: self.key.clone(),
            id: self.id.clone(),
            status: self.status,
            payload: self.payload.clone(),
        }
    }
}

/// Thread-safe map of subscriptions keyed by client-stable key.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    /// Store a new subscription; returns its fresh key.
    ///
    /// The initial id equals the key.
    pub fn register(&self, payload: GraphqlRequestPayload, handler: SubscriptionHandler) -> String {
        let key = Uuid::new_v4().to_string();
        let record = SubscriptionRecord {
            key: key.clone(),
            id: key.clone(),
            status: SubscriptionStatus::Waiting,
            payload,
            handler,
        };
        self.inner.lock().insert(key.clone(), record);
        key
    }

    pub fn snapshot(&self, key: &str) -> Option<SubscriptionSnapshot> {
        self.inner.lock().get(key).map(SubscriptionRecord::snapshot)
    }

    /// Handler for a key, only while the subscription is still `Running`.
    ///
    /// Dispatchers call this immediately before each invocation, so nothing
    /// is delivered after a terminal transition.
    pub fn running_handler(&self, key: &str) -> Option<SubscriptionHandler> {
        let guard = self.inner.lock();
        let record = guard.get(key)?;
        (record.status == SubscriptionStatus::Running).then(|| Arc::clone(&record.handler))
    }

    /// Resolve the key owning a per-connection id.
    pub fn key_for_id(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .values()
            .find(|record| record.id == id)
            .map(|record| record.key.clone())
    }

    pub fn set_status(&self, key: &str, status: SubscriptionStatus) {
        if let Some(record) = self.inner.lock().get_mut(key) {
            record.status = status;
        }
    }

    pub fn remove(&self, key: &str) -> Option<SubscriptionSnapshot> {
        self.inner
            .lock()
            .remove(key)
            .map(|record| record.snapshot())
    }

    /// Count subscriptions, optionally restricted to the given statuses.
    pub fn len(&self, filter: Option<&[SubscriptionStatus]>) -> usize {
        let guard = self.inner.lock();
        match filter {
            None => guard.len(),
            Some(statuses) => guard
                .values()
                .filter(|record| statuses.contains(&record.status))
                .count(),
        }
    }

    /// Subscriptions waiting for a start on the current connection.
    pub fn waiting(&self) -> Vec<SubscriptionSnapshot> {
        self.inner
            .lock()
            .values()
            .filter(|record| record.status == SubscriptionStatus::Waiting)
            .map(SubscriptionRecord::snapshot)
            .collect()
    }

    /// Demote every running subscription to `Waiting` with a fresh id.
    ///
    /// Called on connection teardown; the stable key is untouched.
    pub fn reset_for_reconnect(&self) {
        for record in self.inner.lock().values_mut() {
            if record.status == SubscriptionStatus::Running {
                record.status = SubscriptionStatus::Waiting;
                record.id = Uuid::new_v4().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> SubscriptionHandler {
        Arc::new(|_| Ok(()))
    }

    fn payload() -> GraphqlRequestPayload {
        GraphqlRequestPayload::new("subscription{helloSaid{msg}}")
    }

    #[test]
    fn register_assigns_key_equal_to_id() {
        let registry = SubscriptionRegistry::default();
        let key = registry.register(payload(), noop_handler());

        let snapshot = registry.snapshot(&key).unwrap();
        assert_eq!(snapshot.key(), key);
        assert_eq!(snapshot.id(), key);
        assert_eq!(snapshot.status(), SubscriptionStatus::Waiting);
    }

    #[test]
    fn keys_are_unique_per_registration() {
        let registry = SubscriptionRegistry::default();
        let first = registry.register(payload(), noop_handler());
        let second = registry.register(payload(), noop_handler());
        assert_ne!(first, second);
        assert_eq!(registry.len(None), 2);
    }

    #[test]
    fn len_filters_by_status() {
        let registry = SubscriptionRegistry::default();
        let key = registry.register(payload(), noop_handler());
        registry.register(payload(), noop_handler());
        registry.set_status(&key, SubscriptionStatus::Running);

        assert_eq!(registry.len(Some(&[SubscriptionStatus::Waiting])), 1);
        assert_eq!(registry.len(Some(&[SubscriptionStatus::Running])), 1);
        assert_eq!(
            registry.len(Some(&[
                SubscriptionStatus::Waiting,
                SubscriptionStatus::Running
            ])),
            2
        );
    }

    #[test]
    fn reset_regenerates_ids_for_running_only() {
        let registry = SubscriptionRegistry::default();
        let running = registry.register(payload(), noop_handler());
        let waiting = registry.register(payload(), noop_handler());
        registry.set_status(&running, SubscriptionStatus::Running);

        registry.reset_for_reconnect();

        let demoted = registry.snapshot(&running).unwrap();
        assert_eq!(demoted.status(), SubscriptionStatus::Waiting);
        assert_eq!(demoted.key(), running);
        assert_ne!(demoted.id(), running);

        let untouched = registry.snapshot(&waiting).unwrap();
        assert_eq!(untouched.id(), waiting);
    }

    #[test]
    fn running_handler_gates_on_status() {
        let registry = SubscriptionRegistry::default();
        let key = registry.register(payload(), noop_handler());

        assert!(registry.running_handler(&key).is_none());
        registry.set_status(&key, SubscriptionStatus::Running);
        assert!(registry.running_handler(&key).is_some());
        registry.set_status(&key, SubscriptionStatus::Unsubscribed);
        assert!(registry.running_handler(&key).is_none());
    }

    #[test]
    fn key_for_id_tracks_resets() {
        let registry = SubscriptionRegistry::default();
        let key = registry.register(payload(), noop_handler());
        registry.set_status(&key, SubscriptionStatus::Running);
        assert_eq!(registry.key_for_id(&key).as_deref(), Some(key.as_str()));

        registry.reset_for_reconnect();
        assert_eq!(registry.key_for_id(&key), None);

        let new_id = registry.snapshot(&key).unwrap().id().to_string();
        assert_eq!(registry.key_for_id(&new_id).as_deref(), Some(key.as_str()));
    }

    #[test]
    fn remove_returns_final_snapshot() {
        let registry = SubscriptionRegistry::default();
        let key = registry.register(payload(), noop_handler());
        registry.set_status(&key, SubscriptionStatus::Completed);

        let snapshot = registry.remove(&key).unwrap();
        assert_eq!(snapshot.status(), SubscriptionStatus::Completed);
        assert_eq!(registry.len(None), 0);
        assert!(registry.remove(&key).is_none());
    }
}
