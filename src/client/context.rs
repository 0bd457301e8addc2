// ABOUTME: Per-call deadline and cancellation signal
//
// Every blocking client operation takes a CallContext. A context without a
// deadline gets the configured call timeout applied when the call starts.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::ClientError;

/// Deadline and cancellation for one client operation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Context with no deadline and a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Context that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Context cancelled through `token`.
    #[must_use]
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel: token,
        }
    }

    /// Replace the deadline with `timeout` from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// The deadline, if one was set.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context (and every clone of its token).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Return a copy with `default_timeout` applied when no deadline is set.
    #[must_use]
    pub fn or_timeout(&self, default_timeout: Duration) -> Self {
        let mut ctx = self.clone();
        if ctx.deadline.is_none() {
            ctx.deadline = Some(Instant::now() + default_timeout);
        }
        ctx
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ClientError::DeadlineExceeded(Duration::ZERO));
            }
        }
        Ok(())
    }

    /// Resolve once the deadline passes or the token is cancelled.
    ///
    /// `started` is used to report how long the operation waited.
    pub async fn done(&self, started: Instant) -> ClientError {
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = expiry => ClientError::DeadlineExceeded(started.elapsed()),
            () = self.cancel.cancelled() => ClientError::Cancelled,
        }
    }
}
