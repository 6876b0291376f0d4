use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters, surfaced on the status endpoint
#[derive(Debug, Default)]
pub struct Metrics {
    pub orders_submitted: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub orders_cancelled: AtomicU64,
    pub orders_expired: AtomicU64,
    pub fills_recorded: AtomicU64,
    pub transfers_initiated: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub slices_dispatched: AtomicU64,
    pub copy_orders_submitted: AtomicU64,
    pub recurring_orders_submitted: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    pub orders_expired: u64,
    pub fills_recorded: u64,
    pub transfers_initiated: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub slices_dispatched: u64,
    pub copy_orders_submitted: u64,
    pub recurring_orders_submitted: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            orders_rejected: self.orders_rejected.load(Ordering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(Ordering::Relaxed),
            orders_expired: self.orders_expired.load(Ordering::Relaxed),
            fills_recorded: self.fills_recorded.load(Ordering::Relaxed),
            transfers_initiated: self.transfers_initiated.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            slices_dispatched: self.slices_dispatched.load(Ordering::Relaxed),
            copy_orders_submitted: self.copy_orders_submitted.load(Ordering::Relaxed),
            recurring_orders_submitted: self.recurring_orders_submitted.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = Metrics::new();
        inc(&metrics.orders_submitted);
        inc(&metrics.orders_submitted);
        inc(&metrics.fills_recorded);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.orders_submitted, 2);
        assert_eq!(snapshot.fills_recorded, 1);
        assert_eq!(snapshot.orders_rejected, 0);
    }
}
