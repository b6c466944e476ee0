//! Ingestion statistics
//!
//! Every drop path in the pipeline is counted here so operators can watch
//! drop rates without the pipeline halting. Counters are lock-free and
//! shared between the dispatch task, persistence workers and the transport.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a message or reading was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Topic not in the current directory
    UnrecognizedTopic,
    /// Topic suffix is not a catalogued metric
    UnknownMetric,
    /// Payload is not a number
    NotNumeric,
    /// Number failed the range gate
    OutOfRange,
    /// Persistence queue was full
    QueueFull,
    /// Persistence queue already shut down
    QueueClosed,
    /// Store rejected the reading
    PersistFailed,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::UnrecognizedTopic,
        DropReason::UnknownMetric,
        DropReason::NotNumeric,
        DropReason::OutOfRange,
        DropReason::QueueFull,
        DropReason::QueueClosed,
        DropReason::PersistFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnrecognizedTopic => "unrecognized_topic",
            DropReason::UnknownMetric => "unknown_metric",
            DropReason::NotNumeric => "not_numeric",
            DropReason::OutOfRange => "out_of_range",
            DropReason::QueueFull => "queue_full",
            DropReason::QueueClosed => "queue_closed",
            DropReason::PersistFailed => "persist_failed",
        }
    }

    fn index(&self) -> usize {
        match self {
            DropReason::UnrecognizedTopic => 0,
            DropReason::UnknownMetric => 1,
            DropReason::NotNumeric => 2,
            DropReason::OutOfRange => 3,
            DropReason::QueueFull => 4,
            DropReason::QueueClosed => 5,
            DropReason::PersistFailed => 6,
        }
    }
}

/// Shared ingestion counters
#[derive(Debug, Default)]
pub struct IngestMetrics {
    messages_received: AtomicU64,
    samples_accepted: AtomicU64,
    drops: [AtomicU64; 7],
    readings_complete: AtomicU64,
    readings_partial: AtomicU64,
    readings_submitted: AtomicU64,
    readings_persisted: AtomicU64,
    subscribe_failures: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    subscribed_topics: AtomicU64,
    timers_cancelled: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush handed to persistence
    pub fn record_flush(&self, partial: bool) {
        if partial {
            self.readings_partial.fetch_add(1, Ordering::Relaxed);
        } else {
            self.readings_complete.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pre-assembled reading queued over HTTP
    pub fn record_submitted(&self) {
        self.readings_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.readings_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload(&self, ok: bool) {
        if ok {
            self.reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_subscribed_topics(&self, count: usize) {
        self.subscribed_topics.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_timers_cancelled(&self, count: usize) {
        self.timers_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Drops for one reason
    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received: load(&self.messages_received),
            samples_accepted: load(&self.samples_accepted),
            dropped: DropReason::ALL
                .iter()
                .map(|r| DropCount {
                    reason: r.as_str(),
                    count: self.drops(*r),
                })
                .collect(),
            readings_complete: load(&self.readings_complete),
            readings_partial: load(&self.readings_partial),
            readings_submitted: load(&self.readings_submitted),
            readings_persisted: load(&self.readings_persisted),
            subscribe_failures: load(&self.subscribe_failures),
            reloads: load(&self.reloads),
            reload_failures: load(&self.reload_failures),
            subscribed_topics: load(&self.subscribed_topics),
            timers_cancelled: load(&self.timers_cancelled),
        }
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let s = self.snapshot();
        let mut report = String::new();

        report.push_str("=== Zephy Ingestion Metrics ===\n\n");
        report.push_str(&format!("Messages received: {}\n", s.messages_received));
        report.push_str(&format!("Samples accepted: {}\n", s.samples_accepted));
        report.push_str(&format!(
            "Readings: {} complete, {} partial, {} submitted, {} persisted\n",
            s.readings_complete, s.readings_partial, s.readings_submitted, s.readings_persisted
        ));
        report.push_str(&format!("Subscribed topics: {}\n", s.subscribed_topics));
        report.push_str(&format!(
            "Reloads: {} ok, {} failed\n\n",
            s.reloads, s.reload_failures
        ));

        report.push_str("Drops:\n");
        for drop in s.dropped.iter().filter(|d| d.count > 0) {
            report.push_str(&format!("  {}: {}\n", drop.reason, drop.count));
        }

        report
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub samples_accepted: u64,
    pub dropped: Vec<DropCount>,
    pub readings_complete: u64,
    pub readings_partial: u64,
    pub readings_submitted: u64,
    pub readings_persisted: u64,
    pub subscribe_failures: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub subscribed_topics: u64,
    pub timers_cancelled: u64,
}

impl MetricsSnapshot {
    /// Sum of every drop counter
    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().map(|d| d.count).sum()
    }
}

/// Drop count for one reason
#[derive(Debug, Clone, Serialize)]
pub struct DropCount {
    pub reason: &'static str,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_drops() {
        let metrics = IngestMetrics::new();
        metrics.record_drop(DropReason::NotNumeric);
        metrics.record_drop(DropReason::NotNumeric);
        metrics.record_drop(DropReason::QueueFull);

        assert_eq!(metrics.drops(DropReason::NotNumeric), 2);
        assert_eq!(metrics.drops(DropReason::QueueFull), 1);
        assert_eq!(metrics.drops(DropReason::OutOfRange), 0);
        assert_eq!(metrics.snapshot().total_dropped(), 3);
    }

    #[test]
    fn test_flush_kinds() {
        let metrics = IngestMetrics::new();
        metrics.record_flush(false);
        metrics.record_flush(true);
        metrics.record_flush(true);

        let s = metrics.snapshot();
        assert_eq!(s.readings_complete, 1);
        assert_eq!(s.readings_partial, 2);
    }

    #[test]
    fn test_submitted_readings_are_not_flushes() {
        let metrics = IngestMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();

        let s = metrics.snapshot();
        assert_eq!(s.readings_submitted, 2);
        assert_eq!(s.readings_complete + s.readings_partial, 0);
        assert!(metrics.report().contains("2 submitted"));
    }

    #[test]
    fn test_report() {
        let metrics = IngestMetrics::new();
        metrics.record_message();
        metrics.record_drop(DropReason::UnrecognizedTopic);
        metrics.set_subscribed_topics(6);

        let report = metrics.report();
        assert!(report.contains("Messages received: 1"));
        assert!(report.contains("unrecognized_topic: 1"));
        assert!(report.contains("Subscribed topics: 6"));
        assert!(!report.contains("queue_full"));
    }

    #[test]
    fn test_drop_reason_labels_unique() {
        let mut labels: Vec<_> = DropReason::ALL.iter().map(|r| r.as_str()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), DropReason::ALL.len());
    }
}
