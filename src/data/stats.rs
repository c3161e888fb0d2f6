use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;
use log::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks_applied: u64,
    pub ticks_malformed: u64,
    pub ack_errors: u64,
    pub read_errors: u64,
    pub publishes: u64,
    pub publish_errors: u64,
}

/// Counters shared by the ingest consumer and the flush publisher. They are
/// reset every time they are emitted, so each log line covers one interval.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks_applied: AtomicU64,
    ticks_malformed: AtomicU64,
    ack_errors: AtomicU64,
    read_errors: AtomicU64,
    publishes: AtomicU64,
    publish_errors: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self) {
        self.ticks_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.ticks_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_error(&self) {
        self.ack_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks_applied: self.ticks_applied.swap(0, Ordering::Relaxed),
            ticks_malformed: self.ticks_malformed.swap(0, Ordering::Relaxed),
            ack_errors: self.ack_errors.swap(0, Ordering::Relaxed),
            read_errors: self.read_errors.swap(0, Ordering::Relaxed),
            publishes: self.publishes.swap(0, Ordering::Relaxed),
            publish_errors: self.publish_errors.swap(0, Ordering::Relaxed),
        }
    }

    pub fn log_and_reset(&self) -> StatsSnapshot {
        let snapshot = self.take();
        info!(
            "Pipeline stats - applied: {}, malformed: {}, ack errors: {}, read errors: {}, publishes: {}, publish errors: {}",
            snapshot.ticks_applied,
            snapshot.ticks_malformed,
            snapshot.ack_errors,
            snapshot.read_errors,
            snapshot.publishes,
            snapshot.publish_errors
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_reset_on_take() {
        let stats = PipelineStats::new();
        stats.record_applied();
        stats.record_applied();
        stats.record_publish_error();

        let first = stats.log_and_reset();
        assert_eq!(first.ticks_applied, 2);
        assert_eq!(first.publish_errors, 1);
        assert_eq!(stats.take(), StatsSnapshot::default());
    }
}
