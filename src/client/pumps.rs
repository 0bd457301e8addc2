// ABOUTME: Read and write pumps owning the two halves of one socket
//
// The write pump is the only writer: it drains the outbound queue in order
// and sends a ping every keepalive interval. The read pump is the only
// reader: it decodes envelopes and routes them through the registry.
// A fatal socket error on either side marks the connection's generation as
// failed; both pumps stop when the connection token fires.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::connection::{is_fatal, WsStream};
use super::envelope::Envelope;
use super::error::ClientError;
use super::metrics::ClientMetrics;
use super::registry::{PendingCalls, Routed};

/// Everything the pumps share with the rest of the client
#[derive(Clone)]
pub struct PumpContext {
    pub generation: u64,
    pub registry: PendingCalls,
    pub errors: mpsc::Sender<ClientError>,
    /// Highest failed generation, watched by the supervisor
    pub failed: Arc<watch::Sender<u64>>,
    pub metrics: Arc<ClientMetrics>,
    pub token: CancellationToken,
}

impl PumpContext {
    /// Ask the supervisor to replace this connection.
    ///
    /// Only a generation newer than the last failed one wakes the supervisor,
    /// so both pumps failing together, or a late signal from an older
    /// connection, never hides the current one.
    fn request_reconnect(&self, reason: &str) {
        if self.token.is_cancelled() {
            return;
        }
        let generation = self.generation;
        let raised = self.failed.send_if_modified(|failed| {
            if generation > *failed {
                *failed = generation;
                true
            } else {
                false
            }
        });
        if raised {
            warn!(generation, reason = %reason, "Connection lost, requesting reconnect");
        }
    }

    fn report(&self, err: ClientError) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.errors.try_send(err) {
            warn!(error = %err, "Error channel full, dropping read error");
        }
    }
}

/// Handles for one connection's pumps
pub struct Pumps {
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

/// Split `stream` and start both pumps.
pub fn start(
    stream: WsStream,
    outbound: mpsc::Receiver<String>,
    keepalive: Duration,
    ctx: &PumpContext,
) -> Pumps {
    let (sink, source) = stream.split();

    let writer = tokio::spawn(write_loop(sink, outbound, keepalive, ctx.clone()));
    let reader = tokio::spawn(read_loop(source, ctx.clone()));

    Pumps { writer, reader }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<String>,
    keepalive: Duration,
    ctx: PumpContext,
) {
    debug!(generation = ctx.generation, "Write pump started");

    let mut ticker = tokio::time::interval(keepalive);
    // The first tick completes immediately; skip it
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = ctx.token.cancelled() => break,
            next = outbound.recv() => {
                let Some(text) = next else {
                    debug!(generation = ctx.generation, "Outbound queue closed");
                    break;
                };
                trace!(generation = ctx.generation, bytes = text.len(), "Writing envelope");
                if let Err(e) = sink.send(Message::text(text)).await {
                    error!(generation = ctx.generation, error = %e, "Write to socket failed");
                    ctx.request_reconnect("write failed");
                    break;
                }
            }
            _ = ticker.tick() => {
                trace!(generation = ctx.generation, "Sending keepalive ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    error!(generation = ctx.generation, error = %e, "Keepalive ping failed");
                    ctx.request_reconnect("ping failed");
                    break;
                }
            }
        }
    }

    outbound.close();
    if let Err(e) = sink.close().await {
        debug!(generation = ctx.generation, error = %e, "Ignoring close error");
    }
    debug!(generation = ctx.generation, "Write pump ended");
}

async fn read_loop(mut source: SplitStream<WsStream>, ctx: PumpContext) {
    debug!(generation = ctx.generation, "Read pump started");

    loop {
        let frame = tokio::select! {
            biased;
            () = ctx.token.cancelled() => break,
            frame = source.next() => frame,
        };

        let text = match frame {
            None => {
                ctx.request_reconnect("socket stream ended");
                break;
            }
            Some(Err(e)) if is_fatal(&e) => {
                ctx.request_reconnect(&e.to_string());
                break;
            }
            Some(Err(e)) => {
                ctx.report(ClientError::Transport(e.to_string()));
                continue;
            }
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    ctx.report(ClientError::Protocol("non-UTF-8 binary frame".to_string()));
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(generation = ctx.generation, frame = ?frame, "Server sent close frame");
                ctx.request_reconnect("close frame");
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
        };

        route(&text, &ctx);
    }

    debug!(generation = ctx.generation, "Read pump ended");
}

fn route(text: &str, ctx: &PumpContext) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(generation = ctx.generation, error = %e, "Malformed envelope");
            ctx.report(ClientError::Protocol(format!("malformed envelope: {e}")));
            return;
        }
    };

    match ctx.registry.deliver(envelope) {
        Routed::Update => ctx.metrics.update_delivered(),
        Routed::Dropped => ctx.metrics.update_dropped(),
        Routed::Call | Routed::Unmatched => {}
    }
}
