// ABOUTME: Socket dial, connect handshake and error classification
//
// Opens the WebSocket, sends {"msg":"connect"} and waits for a "connected"
// envelope carrying a session token. Any failure closes the partial socket.

use std::io::ErrorKind;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::envelope::{kind, Envelope};
use super::error::ClientError;

/// The client's socket type
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A socket that completed the connect handshake
pub struct Handshaken {
    pub stream: WsStream,
    pub session: String,
}

/// Dial `url` and run the connect handshake within `timeout`.
pub async fn open(url: &str, timeout: Duration) -> Result<Handshaken, ClientError> {
    debug!(url = %url, "Dialing middleware");

    let (mut stream, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| ClientError::Handshake(format!("dial timed out after {timeout:?}")))?
        .map_err(|source| ClientError::Connect {
            url: url.to_string(),
            source,
        })?;

    match tokio::time::timeout(timeout, handshake(&mut stream)).await {
        Ok(Ok(session)) => {
            info!(url = %url, "Connected to middleware");
            Ok(Handshaken { stream, session })
        }
        Ok(Err(e)) => {
            close_quietly(stream).await;
            Err(e)
        }
        Err(_) => {
            close_quietly(stream).await;
            Err(ClientError::Handshake(format!(
                "no connected reply within {timeout:?}"
            )))
        }
    }
}

async fn handshake(stream: &mut WsStream) -> Result<String, ClientError> {
    let hello = serde_json::to_string(&Envelope::connect())?;
    stream.send(Message::text(hello)).await?;

    loop {
        let Some(frame) = stream.next().await else {
            return Err(ClientError::Handshake("socket closed during handshake".to_string()));
        };

        let text = match frame? {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text.into(),
                Err(_) => {
                    return Err(ClientError::Protocol("non-UTF-8 handshake frame".to_string()))
                }
            },
            Message::Close(_) => {
                return Err(ClientError::Handshake("server closed during handshake".to_string()))
            }
            // Control frames before the reply are fine
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let reply: Envelope = serde_json::from_str(text.as_str())
            .map_err(|e| ClientError::Protocol(format!("malformed handshake reply: {e}")))?;

        if reply.msg() != kind::CONNECTED {
            return Err(ClientError::Handshake(format!(
                "expected connected, got {:?}",
                reply.msg()
            )));
        }

        return match reply.session {
            Some(session) if !session.is_empty() => Ok(session),
            _ => Err(ClientError::Handshake("connected reply without session".to_string())),
        };
    }
}

/// Best-effort close of a socket that will not be used.
pub async fn close_quietly(mut stream: WsStream) {
    if let Err(e) = stream.close(None).await {
        debug!(error = %e, "Ignoring close error on abandoned socket");
    }
}

/// Whether a socket error means the connection is gone and must be replaced.
#[must_use]
pub fn is_fatal(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected
        ),
        tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        ) => true,
        other => {
            warn!(error = %other, "Non-fatal socket error");
            false
        }
    }
}
