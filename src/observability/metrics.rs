//! Change feed metrics
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Thread-safe but lock-minimal

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters shared by a session and every feed it opens
///
/// All counters use Relaxed ordering; eventual consistency is fine here.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    /// Feeds successfully subscribed
    feeds_opened: AtomicU64,
    /// Feeds closed by their consumer
    feeds_closed: AtomicU64,
    /// Feeds ended by a terminal error
    feeds_errored: AtomicU64,
    /// Records handed to a consumer
    records_delivered: AtomicU64,
    /// Records dropped (arrived after close, or buffered at close)
    records_discarded: AtomicU64,
    /// Times the soft buffer limit was crossed
    buffer_warnings: AtomicU64,
    /// Connections re-established after a failed probe
    reconnects: AtomicU64,
    /// Probes that failed
    probe_failures: AtomicU64,
    /// Ordinary queries issued
    queries: AtomicU64,
}

impl FeedMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Feed lifecycle

    pub fn increment_feeds_opened(&self) {
        self.feeds_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feeds_closed(&self) {
        self.feeds_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feeds_errored(&self) {
        self.feeds_errored.fetch_add(1, Ordering::Relaxed);
    }

    // Delivery

    pub fn increment_delivered(&self) {
        self.records_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_discarded(&self, n: u64) {
        self.records_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_buffer_warnings(&self) {
        self.buffer_warnings.fetch_add(1, Ordering::Relaxed);
    }

    // Transport

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_probe_failures(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            feeds_opened: self.feeds_opened.load(Ordering::Relaxed),
            feeds_closed: self.feeds_closed.load(Ordering::Relaxed),
            feeds_errored: self.feeds_errored.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
            buffer_warnings: self.buffer_warnings.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub feeds_opened: u64,
    pub feeds_closed: u64,
    pub feeds_errored: u64,
    pub records_delivered: u64,
    pub records_discarded: u64,
    pub buffer_warnings: u64,
    pub reconnects: u64,
    pub probe_failures: u64,
    pub queries: u64,
}

impl MetricsSnapshot {
    /// Feeds opened and not yet ended
    pub fn feeds_active(&self) -> u64 {
        self.feeds_opened
            .saturating_sub(self.feeds_closed + self.feeds_errored)
    }
}
