// ABOUTME: Pending-call registry correlating responses to waiting callers
//
// Two namespaces share one registry: method-call ids map to one-shot delivery
// slots, collection names map to bounded subscription queues. The read pump
// routes every incoming envelope through here. Each call slot remembers the
// connection generation it was sent on so a torn-down connection can fail
// exactly the calls that can no longer be answered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::error::ClientError;

/// Outcome of routing one incoming envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to the caller waiting on this id
    Call,
    /// Queued for the collection's subscription worker
    Update,
    /// Subscription queue was full; update dropped
    Dropped,
    /// Nobody was waiting for it
    Unmatched,
}

struct PendingCall {
    generation: u64,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Default)]
struct Slots {
    calls: HashMap<String, PendingCall>,
    streams: HashMap<String, mpsc::Sender<Envelope>>,
    /// Highest connection generation that has been torn down
    retired: u64,
    closed: bool,
}

/// Thread-safe identifier → delivery slot map.
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone, Default)]
pub struct PendingCalls {
    slots: Arc<Mutex<Slots>>,
}

impl PendingCalls {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().expect("PendingCalls mutex poisoned")
    }

    /// Register a delivery slot for `id`, sent on connection `generation`.
    ///
    /// Fails with `ClientClosed` after [`close_all`](Self::close_all), with
    /// `ConnectionLost` if `generation` was already retired, and with
    /// `Protocol` if `id` is already pending.
    pub fn register(
        &self,
        id: &str,
        generation: u64,
    ) -> Result<oneshot::Receiver<Envelope>, ClientError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(ClientError::ClientClosed);
        }
        if generation <= slots.retired {
            return Err(ClientError::ConnectionLost);
        }
        if slots.calls.contains_key(id) {
            return Err(ClientError::Protocol(format!("call id {id} already pending")));
        }

        let (tx, rx) = oneshot::channel();
        slots.calls.insert(id.to_string(), PendingCall { generation, tx });
        Ok(rx)
    }

    /// Drop the slots of every call sent on `generation` or earlier.
    ///
    /// Their waiters wake with a closed slot. Later registrations for those
    /// generations fail. Returns the number of calls dropped.
    pub fn retire_generation(&self, generation: u64) -> usize {
        let mut slots = self.lock();
        slots.retired = slots.retired.max(generation);
        let before = slots.calls.len();
        slots.calls.retain(|_, call| call.generation > generation);
        before - slots.calls.len()
    }

    /// Remove the slot for `id`; returns whether it was still present.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    /// Register a subscription queue for `collection`.
    pub fn register_stream(
        &self,
        collection: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Envelope>, ClientError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(ClientError::ClientClosed);
        }
        if slots.streams.contains_key(collection) {
            return Err(ClientError::AlreadySubscribed(collection.to_string()));
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        slots.streams.insert(collection.to_string(), tx);
        Ok(rx)
    }

    /// Remove the queue for `collection`, closing it for its worker.
    pub fn remove_stream(&self, collection: &str) -> bool {
        self.lock().streams.remove(collection).is_some()
    }

    /// Route an incoming envelope to its waiting caller or subscription.
    pub fn deliver(&self, envelope: Envelope) -> Routed {
        if envelope.is_collection_update() {
            return self.deliver_update(envelope);
        }

        let Some(id) = envelope.call_id().map(str::to_string) else {
            return Routed::Unmatched;
        };

        // Take the slot under the lock, send outside it
        let slot = self.lock().calls.remove(&id);
        match slot {
            Some(PendingCall { tx, .. }) => {
                if tx.send(envelope).is_err() {
                    debug!(id = %id, "Caller stopped waiting before response arrived");
                }
                Routed::Call
            }
            None => {
                debug!(id = %id, "Response for unknown or expired call");
                Routed::Unmatched
            }
        }
    }

    fn deliver_update(&self, envelope: Envelope) -> Routed {
        let collection = envelope.collection.clone().unwrap_or_default();
        let Some(tx) = self.lock().streams.get(&collection).cloned() else {
            debug!(collection = %collection, "Update for collection without subscription");
            return Routed::Unmatched;
        };

        match tx.try_send(envelope) {
            Ok(()) => Routed::Update,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(collection = %collection, "Subscription queue full, dropping update");
                Routed::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Routed::Unmatched,
        }
    }

    /// Close every pending slot so waiting callers observe `ClientClosed`.
    ///
    /// Returns the number of calls that were pending. Later registrations fail.
    pub fn close_all(&self) -> usize {
        let mut slots = self.lock();
        slots.closed = true;
        slots.streams.clear();
        let count = slots.calls.len();
        // Dropping the senders wakes every receiver with RecvError
        slots.calls.clear();
        count
    }

    /// Number of pending method calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    /// Whether no method calls are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered subscription queues.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }
}

/// Removes a pending slot when dropped.
///
/// Held by the call engine for the lifetime of one call so the slot is
/// removed exactly once however the call ends.
pub struct PendingGuard {
    registry: PendingCalls,
    id: String,
}

impl PendingGuard {
    /// Guard the slot for `id` in `registry`.
    #[must_use]
    pub fn new(registry: PendingCalls, id: String) -> Self {
        Self { registry, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, value: serde_json::Value) -> Envelope {
        Envelope::result(id, value)
    }

    fn update(collection: &str, n: i64) -> Envelope {
        serde_json::from_value(json!({
            "msg": "changed", "collection": collection, "fields": {"n": n}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_deliver_matches_by_id() {
        let registry = PendingCalls::new();
        let rx1 = registry.register("1", 1).unwrap();
        let rx2 = registry.register("2", 1).unwrap();

        // Deliver out of order
        assert_eq!(registry.deliver(response("2", json!("two"))), Routed::Call);
        assert_eq!(registry.deliver(response("1", json!("one"))), Routed::Call);

        assert_eq!(rx1.await.unwrap().result, Some(json!("one")));
        assert_eq!(rx2.await.unwrap().result, Some(json!("two")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = PendingCalls::new();
        let _rx = registry.register("1", 1).unwrap();
        assert!(matches!(registry.register("1", 1), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_unknown_id_unmatched() {
        let registry = PendingCalls::new();
        assert_eq!(registry.deliver(response("99", json!(null))), Routed::Unmatched);
    }

    #[test]
    fn test_guard_removes_slot() {
        let registry = PendingCalls::new();
        let _rx = registry.register("5", 1).unwrap();
        {
            let _guard = PendingGuard::new(registry.clone(), "5".to_string());
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiters() {
        let registry = PendingCalls::new();
        let rx1 = registry.register("1", 1).unwrap();
        let rx2 = registry.register("2", 1).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());

        assert!(matches!(registry.register("3", 1), Err(ClientError::ClientClosed)));
        assert_eq!(registry.close_all(), 0);
    }

    #[tokio::test]
    async fn test_retire_generation_drops_only_its_calls() {
        let registry = PendingCalls::new();
        let old = registry.register("1", 1).unwrap();
        let current = registry.register("2", 2).unwrap();

        assert_eq!(registry.retire_generation(1), 1);
        assert!(old.await.is_err());
        assert_eq!(registry.len(), 1);

        // Late registration on the retired connection is refused
        assert!(matches!(registry.register("3", 1), Err(ClientError::ConnectionLost)));

        assert_eq!(registry.deliver(response("2", json!("ok"))), Routed::Call);
        assert_eq!(current.await.unwrap().result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_stream_routing_preserves_order() {
        let registry = PendingCalls::new();
        let mut rx = registry.register_stream("alert.list", 8).unwrap();

        for n in 1..=3 {
            assert_eq!(registry.deliver(update("alert.list", n)), Routed::Update);
        }

        for n in 1..=3 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.fields, Some(json!({"n": n})));
        }
    }

    #[test]
    fn test_stream_full_drops() {
        let registry = PendingCalls::new();
        let _rx = registry.register_stream("pool.query", 1).unwrap();

        assert_eq!(registry.deliver(update("pool.query", 1)), Routed::Update);
        assert_eq!(registry.deliver(update("pool.query", 2)), Routed::Dropped);
    }

    #[test]
    fn test_second_stream_rejected() {
        let registry = PendingCalls::new();
        let _rx = registry.register_stream("disk.query", 4).unwrap();
        assert!(matches!(
            registry.register_stream("disk.query", 4),
            Err(ClientError::AlreadySubscribed(_))
        ));

        assert!(registry.remove_stream("disk.query"));
        assert!(registry.register_stream("disk.query", 4).is_ok());
    }
}
