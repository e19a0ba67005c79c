//! Metrics for HA replication
//!
//! Counters and a degradation flag for monitoring replication health.
//! All updates are single atomic operations, so they are safe on the
//! negotiation threads' hook path.
//!
//! # Example
//!
//! ```
//! use fynx_ha::metrics::HaMetrics;
//!
//! let metrics = HaMetrics::new();
//! metrics.record_event_received();
//! metrics.record_enqueued();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.records_enqueued, 1);
//! assert!(!snapshot.degraded);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// HA replication metrics
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct HaMetrics {
    /// Hook invocations seen
    pub events_received: Arc<AtomicU64>,

    /// Records admitted to the replication queue
    pub records_enqueued: Arc<AtomicU64>,

    /// Buffered records evicted to admit newer ones
    pub records_evicted: Arc<AtomicU64>,

    /// Incoming records refused because the buffer held only higher priority records
    pub records_shed: Arc<AtomicU64>,

    /// Records acknowledged by the store
    pub records_published: Arc<AtomicU64>,

    /// Batches acknowledged by the store
    pub publish_batches: Arc<AtomicU64>,

    /// Batches that failed and were requeued
    pub publish_failures: Arc<AtomicU64>,

    /// Connect attempts
    pub connect_attempts: Arc<AtomicU64>,

    /// Failed connect attempts
    pub connect_failures: Arc<AtomicU64>,

    /// Successful connects after a lost connection
    pub reconnects: Arc<AtomicU64>,

    /// Hooks invoked with inconsistent arguments
    pub contract_violations: Arc<AtomicU64>,

    /// Events encoded as generic `observed` records
    pub encode_fallbacks: Arc<AtomicU64>,

    /// Records dropped at shutdown
    pub records_discarded: Arc<AtomicU64>,

    /// Set once any record has been evicted or shed
    pub degraded: Arc<AtomicBool>,
}

impl HaMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hook invocation
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record admitted to the queue
    pub fn record_enqueued(&self) {
        self.records_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record evicted records and raise the degradation flag
    pub fn record_evicted(&self, count: usize) {
        if count > 0 {
            self.records_evicted
                .fetch_add(count as u64, Ordering::Relaxed);
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    /// Record a shed incoming record and raise the degradation flag
    pub fn record_shed(&self) {
        self.records_shed.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Record an acknowledged batch
    ///
    /// # Arguments
    ///
    /// * `records` - Number of records in the batch
    pub fn record_published(&self, records: usize) {
        self.publish_batches.fetch_add(1, Ordering::Relaxed);
        self.records_published
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Record a failed batch
    pub fn record_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connect attempt
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the store accepted the connection
    pub fn record_connect(&self, success: bool) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a successful reconnect
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a contract violation
    pub fn record_contract_violation(&self) {
        self.contract_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an encoder fallback
    pub fn record_encode_fallback(&self) {
        self.encode_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record records dropped at shutdown
    pub fn record_discarded(&self, count: usize) {
        self.records_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Clear the degradation flag, e.g. after an operator acknowledged it
    pub fn clear_degraded(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across counters due to concurrent
    /// updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
            records_shed: self.records_shed.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            publish_batches: self.publish_batches.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
            encode_fallbacks: self.encode_fallbacks.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of all HA metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Hook invocations seen
    pub events_received: u64,
    /// Records admitted to the queue
    pub records_enqueued: u64,
    /// Records evicted under admission pressure
    pub records_evicted: u64,
    /// Incoming records refused under admission pressure
    pub records_shed: u64,
    /// Records acknowledged by the store
    pub records_published: u64,
    /// Batches acknowledged by the store
    pub publish_batches: u64,
    /// Failed batches
    pub publish_failures: u64,
    /// Connect attempts
    pub connect_attempts: u64,
    /// Failed connect attempts
    pub connect_failures: u64,
    /// Successful reconnects
    pub reconnects: u64,
    /// Contract violations
    pub contract_violations: u64,
    /// Encoder fallbacks
    pub encode_fallbacks: u64,
    /// Records dropped at shutdown
    pub records_discarded: u64,
    /// Replication freshness has been lowered for at least one SA
    pub degraded: bool,
}

impl MetricsSnapshot {
    /// Records lost to admission pressure
    pub fn records_lost(&self) -> u64 {
        self.records_evicted + self.records_shed
    }

    /// Fraction of connect attempts that succeeded (1.0 when none were made)
    pub fn connect_success_rate(&self) -> f64 {
        if self.connect_attempts == 0 {
            return 1.0;
        }
        let successes = self.connect_attempts - self.connect_failures;
        successes as f64 / self.connect_attempts as f64
    }
}
