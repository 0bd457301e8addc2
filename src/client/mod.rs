// ABOUTME: Resilient WebSocket RPC client for the appliance middleware
//
// This module turns the asynchronous, multiplexed envelope protocol into
// cancellable request/response calls, and builds job tracking and collection
// subscriptions on top.
//
// Key components:
// - envelope: wire message shape
// - registry: id -> delivery slot correlation (calls and subscription queues)
// - pumps: single-writer / single-reader socket workers with keepalive
// - supervisor: connect handshake, login, reconnect with exponential backoff
// - call: the call engine (id allocation, enqueue, await, cleanup)
// - jobs: poll-to-completion for long-running server jobs
// - subscriptions: per-collection delivery queue and handler worker

pub mod backoff;
mod call;
mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod jobs;
pub mod metrics;
mod pumps;
pub mod registry;
pub mod subscriptions;
mod supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::config::ClientConfig;

pub use context::CallContext;
pub use envelope::{Envelope, ErrorDetail};
pub use error::{ClientError, ClientResult};
pub use jobs::{Job, JobProgress, JobState};
pub use metrics::MetricsSnapshot;
pub use subscriptions::{CollectionUpdate, HandlerError, UpdateKind};

use metrics::ClientMetrics;
use registry::PendingCalls;
use subscriptions::Subscription;
use supervisor::Connection;

/// How long close() waits for each background worker
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the public handle, the supervisor and the call engine
pub(crate) struct Inner {
    config: ClientConfig,

    /// Pending calls and subscription queues
    registry: PendingCalls,

    /// Active subscriptions by collection
    subscriptions: Mutex<HashMap<String, Subscription>>,

    /// The current connection; write-locked only to install or remove one
    conn: RwLock<Option<Connection>>,

    /// Generation of the installed connection, 0 while disconnected
    connected: watch::Sender<u64>,

    next_id: AtomicU64,
    next_generation: AtomicU64,
    closed: AtomicBool,

    /// Parent of every connection token; cancelled on close
    shutdown: CancellationToken,

    /// Non-fatal read errors, observed by the next waiting caller
    errors_tx: mpsc::Sender<ClientError>,
    errors_rx: tokio::sync::Mutex<mpsc::Receiver<ClientError>>,

    /// Highest connection generation whose pumps hit a fatal error
    failed: Arc<watch::Sender<u64>>,

    supervisor: Mutex<Option<JoinHandle<()>>>,

    metrics: Arc<ClientMetrics>,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().expect("subscription table poisoned")
    }
}

/// Handle to one middleware connection.
///
/// Cheap to clone; all clones share the connection. The connection is shut
/// down by [`close`](Self::close), or when the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// let client = Client::connect(ClientConfig::new("ws://nas.local/websocket")).await?;
/// let version: String = client.call(&CallContext::new(), "system.version", vec![]).await?;
/// client.close().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    _shutdown: Arc<DropGuard>,
}

impl Client {
    /// Connect, authenticate if credentials are configured, and start the
    /// reconnect supervisor.
    ///
    /// A dial, handshake or login failure tears down the half-built client
    /// and is returned as-is.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;

        let (errors_tx, errors_rx) = mpsc::channel(config.error_queue_size);
        let failed = Arc::new(watch::Sender::new(0));
        let failures = failed.subscribe();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            registry: PendingCalls::new(),
            subscriptions: Mutex::new(HashMap::new()),
            conn: RwLock::new(None),
            connected: watch::Sender::new(0),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            errors_tx,
            errors_rx: tokio::sync::Mutex::new(errors_rx),
            failed,
            supervisor: Mutex::new(None),
            metrics: Arc::new(ClientMetrics::new()),
            config,
        });

        let client = Self {
            inner: Arc::clone(&inner),
            _shutdown: Arc::new(shutdown.drop_guard()),
        };

        if let Err(e) = supervisor::establish(&inner).await {
            client.close().await?;
            return Err(e);
        }

        let handle = tokio::spawn(supervisor::supervise(Arc::clone(&inner), failures));
        *inner.supervisor.lock().expect("supervisor slot poisoned") = Some(handle);

        Ok(client)
    }

    /// Shut the client down.
    ///
    /// Fails every pending call with `ClientClosed`, stops subscription
    /// workers, closes the socket and waits for background workers to exit.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(url = %inner.config.url, "Closing middleware client");

        let cancelled = inner.registry.close_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending calls");
        }

        // Unblocks both pumps and the supervisor
        inner.shutdown.cancel();
        inner.connected.send_replace(0);

        let conn = inner.conn.write().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }

        let subscriptions: Vec<Subscription> =
            inner.subscriptions().drain().map(|(_, sub)| sub).collect();
        for sub in subscriptions {
            sub.stop(&inner.registry).await;
        }

        let handle = inner.supervisor.lock().expect("supervisor slot poisoned").take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await;
        }

        info!(url = %inner.config.url, "Middleware client closed");
        Ok(())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether a connection is currently installed.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow() != 0
    }

    /// Session token of the current connection.
    pub async fn session(&self) -> Option<String> {
        self.inner.conn.read().await.as_ref().map(|conn| conn.session.clone())
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Collections with an active subscription, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subscriptions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the client's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(self.inner.registry.len())
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}
