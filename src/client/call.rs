// ABOUTME: Call engine turning envelopes into request/response calls
//
// A call allocates the next id, registers a delivery slot, enqueues the
// method envelope for the write pump and then waits for whichever comes
// first: the matched response, a read error from the shared error channel,
// the deadline, or cancellation. The slot is released by a guard however the
// call ends. A call is pinned to the connection it was sent on; if that
// connection is torn down first the call fails with ConnectionLost.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::context::CallContext;
use super::envelope::Envelope;
use super::error::{ClientError, ClientResult};
use super::registry::PendingGuard;
use super::{Client, Inner};

/// Outbound queue of one connection, tagged with its generation
#[derive(Clone)]
pub(crate) struct Route {
    pub generation: u64,
    pub sender: mpsc::Sender<String>,
}

impl Inner {
    /// Run one call.
    ///
    /// With `route` set the envelope goes to that connection (login on a
    /// connection that is not installed yet, resubscribe on a fresh one);
    /// otherwise to the installed connection, waiting for one if the
    /// supervisor is between connections.
    pub(crate) async fn exchange(
        &self,
        route: Option<Route>,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<Value> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }
        ctx.check()?;

        let ctx = ctx.or_timeout(self.config.call_timeout);
        let started = Instant::now();
        self.metrics.call_started();

        let result = self.exchange_once(route, &ctx, started, method, params).await;
        if let Err(e) = &result {
            self.metrics.call_failed();
            debug!(method, error = %e, elapsed = ?started.elapsed(), "Call failed");
        }
        result
    }

    async fn exchange_once(
        &self,
        route: Option<Route>,
        ctx: &CallContext,
        started: Instant,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<Value> {
        let Route { generation, sender } = match route {
            Some(route) => route,
            None => self.current_route(ctx, started).await?,
        };

        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed).to_string();
        let response = self.registry.register(&id, generation)?;
        let _guard = PendingGuard::new(self.registry.clone(), id.clone());

        let text = serde_json::to_string(&Envelope::method(id.clone(), method, params))?;
        trace!(id = %id, method, generation, "Enqueueing call");

        tokio::select! {
            biased;
            sent = sender.send(text) => sent.map_err(|_| ClientError::NotConnected)?,
            err = ctx.done(started) => return Err(err),
        }

        let envelope = tokio::select! {
            biased;
            delivered = response => delivered.map_err(|_| self.slot_closed())?,
            Some(err) = self.next_error() => return Err(err),
            err = ctx.done(started) => return Err(err),
        };

        trace!(id = %id, method, elapsed = ?started.elapsed(), "Call answered");
        decode(envelope)
    }

    /// Why a delivery slot closed without a response.
    fn slot_closed(&self) -> ClientError {
        if self.is_closed() {
            ClientError::ClientClosed
        } else {
            ClientError::ConnectionLost
        }
    }

    /// Route to the installed connection, waiting within the context for one
    /// to be installed.
    async fn current_route(&self, ctx: &CallContext, started: Instant) -> ClientResult<Route> {
        let mut installed = self.connected.subscribe();

        loop {
            if let Some(conn) = self.conn.read().await.as_ref() {
                // A closed queue means the pumps are gone; wait for the next one
                if !conn.outbound.is_closed() {
                    return Ok(conn.route());
                }
            }
            if self.is_closed() {
                return Err(ClientError::ClientClosed);
            }

            trace!("Waiting for a connection");
            tokio::select! {
                biased;
                changed = installed.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::ClientClosed);
                    }
                }
                err = ctx.done(started) => {
                    return Err(match err {
                        ClientError::DeadlineExceeded(_) => ClientError::NotConnected,
                        other => other,
                    });
                }
            }
        }
    }

    async fn next_error(&self) -> Option<ClientError> {
        self.errors_rx.lock().await.recv().await
    }
}

fn decode(envelope: Envelope) -> ClientResult<Value> {
    if let Some(detail) = envelope.error {
        return Err(ClientError::Remote(detail));
    }
    Ok(envelope.result.unwrap_or(Value::Null))
}

impl Client {
    /// Invoke `method` and decode its result into `T`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let version: String = client.call(&CallContext::new(), "system.version", vec![]).await?;
    /// ```
    pub async fn call<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<T> {
        let value = self.call_raw(ctx, method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke `method` and return its undecoded result.
    pub async fn call_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<Value> {
        self.inner.exchange(None, ctx, method, params).await
    }

    /// Invoke `method`, discarding its result.
    pub async fn call_unit(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<()> {
        self.call_raw(ctx, method, params).await.map(|_| ())
    }
}
