// ABOUTME: Reconnect delay schedule for the connection supervisor
//
// The n-th consecutive failed attempt waits initial * 2^(n-1), never more
// than the ceiling. Attempts are unbounded; a successful reconnect restarts
// the schedule.

use std::time::Duration;

use crate::config::ClientConfig;

/// One scheduled reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// 1-based attempt number since the last successful connection
    pub attempt: u32,
    /// Wait before dialing
    pub delay: Duration,
}

/// Doubling delay schedule between reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub const fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            attempt: 0,
        }
    }

    /// Schedule from `reconnect_backoff_base` / `reconnect_backoff_max`.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.reconnect_backoff_base, config.reconnect_backoff_max)
    }

    /// Advance to the next attempt.
    pub fn next_retry(&mut self) -> Retry {
        self.attempt = self.attempt.saturating_add(1);

        // Overflow of either factor means the ceiling
        let delay = 2u32
            .checked_pow(self.attempt - 1)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling));

        Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Record a successful connection; returns how many attempts it took.
    pub fn succeeded(&mut self) -> u32 {
        std::mem::take(&mut self.attempt)
    }

    /// Attempts made since the last success.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}
