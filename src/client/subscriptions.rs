// ABOUTME: Subscription multiplexer for pushed collection updates
//
// Each subscribed collection gets a bounded delivery queue in the registry
// and a dedicated worker thread that feeds updates to the caller's handler in
// arrival order. A slow or failing handler only affects its own collection;
// the read pump never waits on it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::context::CallContext;
use super::envelope::{kind, Envelope};
use super::error::{ClientError, ClientResult};
use super::registry::PendingCalls;
use super::{Client, WORKER_JOIN_TIMEOUT};

/// Error type handlers may return; it is logged and delivery continues
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What happened to an item of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Added,
    Changed,
    Removed,
}

/// One pushed change to a subscribed collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionUpdate {
    pub collection: String,
    pub kind: UpdateKind,
    /// Id of the affected item, when the server sends one
    pub id: Option<Value>,
    pub fields: Option<Value>,
}

impl CollectionUpdate {
    /// Build from a pushed envelope; `None` if it is not a collection update.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        let kind = match envelope.msg() {
            kind::ADDED => UpdateKind::Added,
            kind::CHANGED => UpdateKind::Changed,
            kind::REMOVED => UpdateKind::Removed,
            _ => return None,
        };
        Some(Self {
            collection: envelope.collection?,
            kind,
            id: envelope.id,
            fields: envelope.fields,
        })
    }
}

/// An active subscription
pub(crate) struct Subscription {
    collection: String,
    /// Id returned by `core.subscribe`, needed to unsubscribe
    pub server_id: Value,
    stop: Arc<AtomicBool>,
    worker: thread::JoinHandle<()>,
}

impl Subscription {
    /// Close the delivery queue and wait for the worker to finish its
    /// current handler call.
    pub async fn stop(self, registry: &PendingCalls) {
        self.stop.store(true, Ordering::Release);
        registry.remove_stream(&self.collection);

        let collection = self.collection;
        let worker = self.worker;
        let joined =
            tokio::time::timeout(WORKER_JOIN_TIMEOUT, tokio::task::spawn_blocking(move || worker.join()))
                .await;
        match joined {
            Ok(Ok(Ok(()))) => debug!(collection = %collection, "Subscription worker stopped"),
            Ok(_) => warn!(collection = %collection, "Subscription worker ended abnormally"),
            Err(_) => warn!(collection = %collection, "Subscription worker still busy, detaching"),
        }
    }
}

fn spawn_worker<F>(
    collection: &str,
    mut updates: mpsc::Receiver<Envelope>,
    stop: Arc<AtomicBool>,
    mut handler: F,
) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnMut(CollectionUpdate) -> Result<(), HandlerError> + Send + 'static,
{
    let name = collection.to_string();
    thread::Builder::new()
        .name(format!("sub-{collection}"))
        .spawn(move || {
            debug!(collection = %name, "Subscription worker started");

            while let Some(envelope) = updates.blocking_recv() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let Some(update) = CollectionUpdate::from_envelope(envelope) else {
                    continue;
                };

                match panic::catch_unwind(AssertUnwindSafe(|| handler(update))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(collection = %name, error = %e, "Subscription handler failed"),
                    Err(_) => error!(collection = %name, "Subscription handler panicked"),
                }
            }

            debug!(collection = %name, "Subscription worker exiting");
        })
}

impl Client {
    /// Subscribe to pushed updates for `collection`.
    ///
    /// `handler` runs on a dedicated thread, one update at a time, in the
    /// order the server sent them. A second subscription to the same
    /// collection fails with `AlreadySubscribed`.
    pub async fn subscribe<F>(
        &self,
        ctx: &CallContext,
        collection: &str,
        handler: F,
    ) -> ClientResult<()>
    where
        F: FnMut(CollectionUpdate) -> Result<(), HandlerError> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ClientError::ClientClosed);
        }

        // Reserve the queue first so updates racing the reply are kept
        let updates = inner
            .registry
            .register_stream(collection, inner.config.subscription_queue_size)?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = match spawn_worker(collection, updates, Arc::clone(&stop), handler) {
            Ok(worker) => worker,
            Err(e) => {
                inner.registry.remove_stream(collection);
                return Err(e.into());
            }
        };

        let subscription = |server_id| Subscription {
            collection: collection.to_string(),
            server_id,
            stop,
            worker,
        };

        match self.call_raw(ctx, "core.subscribe", vec![json!(collection)]).await {
            Ok(server_id) => {
                info!(collection, "Subscribed");
                inner
                    .subscriptions()
                    .insert(collection.to_string(), subscription(server_id));
                Ok(())
            }
            Err(e) => {
                subscription(Value::Null).stop(&inner.registry).await;
                Err(e)
            }
        }
    }

    /// Cancel the subscription for `collection`.
    ///
    /// No-op if there is none. The worker is stopped even if the server
    /// rejects the unsubscribe call; that error is still returned.
    pub async fn unsubscribe(&self, ctx: &CallContext, collection: &str) -> ClientResult<()> {
        let inner = &self.inner;
        let Some(subscription) = inner.subscriptions().remove(collection) else {
            debug!(collection, "Not subscribed");
            return Ok(());
        };

        let result = self
            .call_unit(ctx, "core.unsubscribe", vec![subscription.server_id.clone()])
            .await;
        subscription.stop(&inner.registry).await;

        match &result {
            Ok(()) => info!(collection, "Unsubscribed"),
            Err(e) => warn!(collection, error = %e, "Server-side unsubscribe failed"),
        }
        result
    }
}
