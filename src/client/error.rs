// ABOUTME: Error taxonomy for the middleware client
//
// Transport, protocol, application, timeout/cancellation and lifecycle
// failures all surface as one ClientError so callers can match uniformly.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::envelope::ErrorDetail;
use super::jobs::JobState;

/// Errors returned by every public client operation
#[derive(Debug, Error)]
pub enum ClientError {
    // === Transport ===
    /// Dialing the WebSocket failed
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// Socket-level failure after the connection was established
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-fatal read error reported by the read pump
    #[error("Transport error: {0}")]
    Transport(String),

    /// No usable connection is installed
    #[error("Not connected")]
    NotConnected,

    /// The connection a call was sent on was torn down before it answered
    #[error("Connection lost before the call was answered")]
    ConnectionLost,

    // === Protocol ===
    /// The connect handshake did not complete
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A frame violated the envelope protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Encoding or decoding JSON failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Application ===
    /// The server answered with an error envelope
    #[error("Remote error {0}")]
    Remote(ErrorDetail),

    /// A tracked job ended in a failed or aborted state
    #[error("Job {id} ({method}) {state}: {message}")]
    JobFailed {
        id: i64,
        method: String,
        state: JobState,
        message: String,
    },

    /// The job query returned no record for the id
    #[error("Job {0} not found")]
    JobNotFound(i64),

    // === Timeout / cancellation ===
    /// The caller's deadline expired
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    // === Lifecycle ===
    /// The client was shut down
    #[error("Client closed")]
    ClientClosed,

    /// Login was rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A subscription for this collection is already active
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    // === Configuration ===
    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::WebSocket(_)
                | Self::Io(_)
                | Self::Transport(_)
                | Self::NotConnected
                | Self::ConnectionLost
                | Self::Handshake(_)
                | Self::DeadlineExceeded(_)
        )
    }

    /// The server error detail, for application errors.
    #[must_use]
    pub const fn remote_detail(&self) -> Option<&ErrorDetail> {
        match self {
            Self::Remote(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Result alias used across the client
pub type ClientResult<T> = Result<T, ClientError>;
