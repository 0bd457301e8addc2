// ABOUTME: In-process mock middleware server for integration tests
//
// Speaks the envelope protocol over a real WebSocket: answers the connect
// handshake, dispatches method calls to a test-supplied handler, can push
// collection updates, drop every live connection, or refuse new ones.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// How the server answers one method call
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Answer after a delay without blocking other calls
    Delayed(Duration, Box<Reply>),
    /// Never answer
    Silent,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self::Result(value)
    }

    pub fn after(delay: Duration, reply: Self) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

type Handler = Arc<dyn Fn(&str, &[Value]) -> Reply + Send + Sync>;

/// A recorded method call
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub params: Vec<Value>,
}

pub struct MockServer {
    pub url: String,
    handler: Handler,
    pushes: broadcast::Sender<String>,
    kill: Arc<Mutex<CancellationToken>>,
    accepting: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<Recorded>>>,
    shutdown: CancellationToken,
}

impl MockServer {
    /// Bind to an ephemeral loopback port and start accepting.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pushes, _) = broadcast::channel(256);

        let server = Self {
            url: format!("ws://{addr}/websocket"),
            handler: Arc::new(handler),
            pushes,
            kill: Arc::new(Mutex::new(CancellationToken::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            connections: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
        };

        let ctx = ConnCtx {
            handler: Arc::clone(&server.handler),
            pushes: server.pushes.clone(),
            calls: Arc::clone(&server.calls),
        };
        let kill = Arc::clone(&server.kill);
        let accepting = Arc::clone(&server.accepting);
        let connections = Arc::clone(&server.connections);
        let shutdown = server.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => continue,
                    },
                };

                if !accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }

                let n = connections.fetch_add(1, Ordering::SeqCst) + 1;
                let token = kill.lock().unwrap().clone();
                tokio::spawn(serve(stream, format!("session-{n}"), ctx.clone(), token));
            }
        });

        server
    }

    /// Push a raw JSON value to every live connection.
    pub fn push(&self, value: Value) {
        let _ = self.pushes.send(value.to_string());
    }

    /// Push a text frame verbatim.
    pub fn push_raw(&self, text: &str) {
        let _ = self.pushes.send(text.to_string());
    }

    /// Push a `changed` update for `collection`.
    pub fn push_changed(&self, collection: &str, id: i64, fields: Value) {
        self.push(json!({
            "msg": "changed",
            "collection": collection,
            "id": id,
            "fields": fields,
        }));
    }

    /// Abruptly drop every live connection (no close frame).
    pub fn drop_connections(&self) {
        let mut kill = self.kill.lock().unwrap();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// Refuse (accept then immediately drop) new connections while false.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Connections that completed the TCP accept while accepting.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every call received for `method`, in arrival order.
    pub fn calls_to(&self, method: &str) -> Vec<Recorded> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.kill.lock().unwrap().cancel();
    }
}

#[derive(Clone)]
struct ConnCtx {
    handler: Handler,
    pushes: broadcast::Sender<String>,
    calls: Arc<Mutex<Vec<Recorded>>>,
}

async fn serve(stream: TcpStream, session: String, ctx: ConnCtx, kill: CancellationToken) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut pushes = ctx.pushes.subscribe();

    let writer_kill = kill.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_kill.cancelled() => break,
                text = out_rx.recv() => match text {
                    Some(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                pushed = pushes.recv() => match pushed {
                    Ok(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        // Dropping the sink half without a close frame
    });

    loop {
        let frame = tokio::select! {
            () = kill.cancelled() => break,
            frame = source.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        match envelope["msg"].as_str() {
            Some("connect") => {
                let _ = out_tx.send(json!({"msg": "connected", "session": session}).to_string());
            }
            Some("method") => {
                let id = envelope["id"].clone();
                let method = envelope["method"].as_str().unwrap_or_default().to_string();
                let params = envelope["params"].as_array().cloned().unwrap_or_default();
                ctx.calls.lock().unwrap().push(Recorded {
                    method: method.clone(),
                    params: params.clone(),
                });

                let reply = (ctx.handler)(&method, &params);
                respond(id, reply, out_tx.clone());
            }
            _ => {}
        }
    }

    kill.cancel();
    let _ = writer.await;
}

fn respond(id: Value, reply: Reply, out: mpsc::UnboundedSender<String>) {
    match reply {
        Reply::Result(value) => {
            let _ = out.send(json!({"msg": "result", "id": id, "result": value}).to_string());
        }
        Reply::Error(code, message) => {
            let _ = out.send(
                json!({
                    "msg": "result",
                    "id": id,
                    "error": {"error": code, "errname": "ENOENT", "message": message, "type": "VALIDATION"},
                })
                .to_string(),
            );
        }
        Reply::Delayed(delay, reply) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                respond(id, *reply, out);
            });
        }
        Reply::Silent => {}
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
