// ABOUTME: Connection lifecycle: establish, install, tear down, reconnect
//
// establish() dials, handshakes, starts the pumps and logs in before a
// connection becomes visible to callers. supervise() runs for the client's
// lifetime: it waits for the current generation's pumps to report a fatal
// error, tears that connection down (failing the calls sent on it) and
// retries with exponential backoff until a new one is installed or the
// client shuts down. Resubscription runs beside the supervisor, bound to the
// new connection, so a stalled or dying connection never holds it up.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectBackoff;
use super::call::Route;
use super::connection::{self, Handshaken};
use super::context::CallContext;
use super::error::{ClientError, ClientResult};
use super::pumps::{self, PumpContext, Pumps};
use super::Inner;

/// How long teardown waits for each pump to exit
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One live, authenticated connection
pub(crate) struct Connection {
    pub generation: u64,
    pub session: String,
    pub outbound: mpsc::Sender<String>,
    token: CancellationToken,
    pumps: Pumps,
}

impl Connection {
    pub(crate) fn route(&self) -> Route {
        Route {
            generation: self.generation,
            sender: self.outbound.clone(),
        }
    }

    /// Stop both pumps and wait for them to release the socket.
    pub async fn shutdown(self) {
        let Self {
            generation,
            outbound,
            token,
            pumps,
            ..
        } = self;

        token.cancel();
        drop(outbound);

        if tokio::time::timeout(PUMP_JOIN_TIMEOUT, pumps.writer).await.is_err() {
            warn!(generation, "Write pump did not stop in time");
        }
        if tokio::time::timeout(PUMP_JOIN_TIMEOUT, pumps.reader).await.is_err() {
            warn!(generation, "Read pump did not stop in time");
        }
        debug!(generation, "Connection torn down");
    }
}

/// Dial, handshake, start pumps, log in, then install the connection.
pub(crate) async fn establish(inner: &Arc<Inner>) -> ClientResult<()> {
    let config = &inner.config;
    let Handshaken { stream, session } =
        connection::open(&config.url, config.handshake_timeout).await?;

    let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
    let token = inner.shutdown.child_token();
    let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_size);

    let pumps = pumps::start(
        stream,
        outbound_rx,
        config.keepalive_interval,
        &PumpContext {
            generation,
            registry: inner.registry.clone(),
            errors: inner.errors_tx.clone(),
            failed: Arc::clone(&inner.failed),
            metrics: Arc::clone(&inner.metrics),
            token: token.clone(),
        },
    );

    let conn = Connection {
        generation,
        session,
        outbound,
        token,
        pumps,
    };

    if let Err(e) = login(inner, &conn).await {
        conn.shutdown().await;
        return Err(e);
    }

    let mut slot = inner.conn.write().await;
    if inner.is_closed() {
        drop(slot);
        conn.shutdown().await;
        return Err(ClientError::ClientClosed);
    }
    let previous = slot.replace(conn);
    drop(slot);

    if let Some(previous) = previous {
        retire(inner, previous).await;
    }

    inner.connected.send_replace(generation);
    info!(generation, url = %config.url, "Connection ready");
    Ok(())
}

async fn login(inner: &Inner, conn: &Connection) -> ClientResult<()> {
    let Some(credentials) = &inner.config.credentials else {
        return Ok(());
    };

    let (method, params) = credentials.login_call();
    let ctx = CallContext::with_timeout(inner.config.call_timeout);

    match inner.exchange(Some(conn.route()), &ctx, method, params).await {
        Ok(Value::Bool(true)) => {
            debug!(generation = conn.generation, method, "Logged in");
            Ok(())
        }
        Ok(other) => Err(ClientError::AuthenticationFailed(format!(
            "{method} returned {other}"
        ))),
        Err(ClientError::Remote(detail)) => {
            Err(ClientError::AuthenticationFailed(detail.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Remove the installed connection, if any, and stop its pumps.
pub(crate) async fn teardown(inner: &Inner) {
    inner.connected.send_replace(0);
    let conn = inner.conn.write().await.take();
    if let Some(conn) = conn {
        retire(inner, conn).await;
    }
}

/// Fail the calls still waiting on `conn`, then stop it.
async fn retire(inner: &Inner, conn: Connection) {
    let generation = conn.generation;
    let lost = inner.registry.retire_generation(generation);
    if lost > 0 {
        warn!(generation, lost, "Failing calls sent on lost connection");
    }
    conn.shutdown().await;
}

/// Reconnect loop; runs until the client shuts down.
pub(crate) async fn supervise(inner: Arc<Inner>, mut failures: watch::Receiver<u64>) {
    let shutdown = inner.shutdown.clone();
    let mut backoff = ReconnectBackoff::from_config(&inner.config);

    debug!("Connection supervisor started");

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            changed = failures.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let generation = *failures.borrow_and_update();

        let current = inner.conn.read().await.as_ref().map(|conn| conn.generation);
        if current != Some(generation) {
            debug!(generation, ?current, "Ignoring stale reconnect signal");
            continue;
        }

        teardown(&inner).await;

        if !reconnect(&inner, &mut backoff, &shutdown).await {
            break;
        }

        inner.metrics.reconnected();
        if inner.config.resubscribe_on_reconnect {
            spawn_resubscribe(&inner).await;
        }
    }

    debug!("Connection supervisor stopped");
}

/// Retry establish() until it succeeds; false if shut down first.
async fn reconnect(
    inner: &Arc<Inner>,
    backoff: &mut ReconnectBackoff,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        let retry = backoff.next_retry();
        debug!(attempt = retry.attempt, delay = ?retry.delay, "Waiting before reconnect");

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(retry.delay) => {}
        }

        let result = tokio::select! {
            biased;
            () = shutdown.cancelled() => return false,
            result = establish(inner) => result,
        };

        match result {
            Ok(()) => {
                info!(attempts = backoff.succeeded(), "Reconnected");
                return true;
            }
            Err(ClientError::ClientClosed) => return false,
            Err(e) => {
                error!(attempt = retry.attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
}

/// Start re-issuing every active subscription on the installed connection.
async fn spawn_resubscribe(inner: &Arc<Inner>) {
    let pinned = inner
        .conn
        .read()
        .await
        .as_ref()
        .map(|conn| (conn.route(), conn.token.clone()));

    // Already gone again; the next install resubscribes
    let Some((route, token)) = pinned else {
        return;
    };
    if inner.subscriptions().is_empty() {
        return;
    }

    tokio::spawn(resubscribe(Arc::clone(inner), route, token));
}

/// Re-issue every active subscription on one connection.
///
/// Each call is cancelled by the connection's token, so the task ends as
/// soon as that connection is torn down.
async fn resubscribe(inner: Arc<Inner>, route: Route, token: CancellationToken) {
    let generation = route.generation;
    let collections: Vec<String> = inner.subscriptions().keys().cloned().collect();

    for collection in collections {
        let ctx = CallContext::with_cancel(token.clone());
        match inner
            .exchange(Some(route.clone()), &ctx, "core.subscribe", vec![json!(collection)])
            .await
        {
            Ok(server_id) => {
                if let Some(sub) = inner.subscriptions().get_mut(&collection) {
                    sub.server_id = server_id;
                }
                debug!(generation, collection = %collection, "Resubscribed");
            }
            Err(ClientError::Cancelled | ClientError::ConnectionLost | ClientError::ClientClosed) => {
                debug!(generation, "Connection went away during resubscribe");
                return;
            }
            Err(e) => {
                warn!(generation, collection = %collection, error = %e, "Resubscribe failed");
            }
        }
    }
}
