// ABOUTME: Counters for calls, reconnects and subscription delivery
//
// Tracks:
// - Calls: total, failed
// - Connection: reconnects
// - Subscriptions: delivered, dropped updates

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Client-level metrics
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub calls_total: AtomicU64,
    pub calls_failed: AtomicU64,
    pub reconnects: AtomicU64,
    pub updates_delivered: AtomicU64,
    pub updates_dropped: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_started(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_delivered(&self) {
        self.updates_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_dropped(&self) {
        self.updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self, pending_calls: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
            pending_calls,
        }
    }
}

/// Serializable view of [`ClientMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub calls_total: u64,
    pub calls_failed: u64,
    pub reconnects: u64,
    pub updates_delivered: u64,
    pub updates_dropped: u64,
    pub pending_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ClientMetrics::new();
        metrics.call_started();
        metrics.call_started();
        metrics.call_failed();
        metrics.reconnected();
        metrics.update_dropped();

        let snap = metrics.snapshot(3);
        assert_eq!(snap.calls_total, 2);
        assert_eq!(snap.calls_failed, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.updates_delivered, 0);
        assert_eq!(snap.updates_dropped, 1);
        assert_eq!(snap.pending_calls, 3);
    }
}
