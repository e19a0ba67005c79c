//! Structured logging for HA replication
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Key material is never passed to any of these functions.
//!
//! # Log Levels
//!
//! - **DEBUG**: Batches published, records dropped after shutdown
//! - **INFO**: Store connected, service lifecycle
//! - **WARN**: Connect/publish failures, backoff, eviction (degraded replication)
//! - **ERROR**: Contract violations by the negotiation engine, hook panics
//!
//! # Example
//!
//! ```no_run
//! use fynx_ha::logging;
//! use fynx_ha::SaIdentifier;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("fynx_ha=debug")
//!     .init();
//!
//! logging::log_store_connected("redis://10.0.0.5:6379/0", 1);
//! logging::log_batch_published(SaIdentifier::new(7), 1, 4);
//! ```

use crate::event::{EventKind, SaIdentifier};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Log a successful store connect
///
/// # Arguments
///
/// * `store` - Store endpoint, as described by the transport
/// * `attempt` - Attempt number since the connection was lost (1 = first try)
pub fn log_store_connected(store: &str, attempt: u32) {
    info!(
        store = store,
        attempt = attempt,
        "HA store connected"
    );
}

/// Log a failed store connect
pub fn log_connect_failed(store: &str, error: &str) {
    warn!(
        store = store,
        error = error,
        "HA store connect failed"
    );
}

/// Log the next scheduled reconnect
///
/// # Arguments
///
/// * `attempt` - Upcoming attempt number
/// * `delay` - Wait before the attempt
pub fn log_backoff_scheduled(attempt: u32, delay: Duration) {
    warn!(
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        "HA store unreachable, reconnect scheduled"
    );
}

/// Log a lost store connection
pub fn log_connection_lost(error: &str) {
    warn!(error = error, "HA store connection lost");
}

/// Log a batch acknowledged by the store
pub fn log_batch_published(sa: SaIdentifier, first_seq: u64, last_seq: u64) {
    debug!(
        sa_id = sa.value(),
        first_seq = first_seq,
        last_seq = last_seq,
        "HA batch published"
    );
}

/// Log a batch that failed and was requeued
pub fn log_publish_failed(sa: SaIdentifier, batch_len: usize, error: &str) {
    warn!(
        sa_id = sa.value(),
        batch_len = batch_len,
        error = error,
        "HA publish failed, batch requeued"
    );
}

/// Log a buffered record evicted under admission pressure
pub fn log_eviction(sa: SaIdentifier, kind: EventKind, sequence: u64) {
    warn!(
        sa_id = sa.value(),
        event_kind = kind.as_str(),
        seq_num = sequence,
        "HA replication degraded - buffered record evicted"
    );
}

/// Log an incoming record refused under admission pressure
pub fn log_shed(sa: SaIdentifier, kind: EventKind, sequence: u64) {
    warn!(
        sa_id = sa.value(),
        event_kind = kind.as_str(),
        seq_num = sequence,
        "HA replication degraded - incoming record shed"
    );
}

/// Log a hook invoked with inconsistent arguments
pub fn log_contract_violation(hook: &str, reason: &str) {
    error!(hook = hook, reason = reason, "HA listener contract violation");
}

/// Log a hook that panicked; the engine still sees `true`
pub fn log_hook_panicked(hook: &str) {
    error!(hook = hook, "HA listener hook panicked, event not replicated");
}

/// Log key material that could not be sealed
pub fn log_seal_failed(sa: SaIdentifier, error: &str) {
    warn!(
        sa_id = sa.value(),
        error = error,
        "HA key material withheld, sealing failed"
    );
}

/// Log an event encoded as a generic record
pub fn log_encode_fallback(sa: SaIdentifier, kind: EventKind) {
    warn!(
        sa_id = sa.value(),
        event_kind = kind.as_str(),
        "HA event encoded as generic observed record"
    );
}

/// Log an event arriving after the queue was closed
pub fn log_dropped_after_close(sa: SaIdentifier, kind: EventKind) {
    debug!(
        sa_id = sa.value(),
        event_kind = kind.as_str(),
        "HA queue closed, event not replicated"
    );
}

/// Log service start
pub fn log_service_started(node_id: &str, dispatchers: usize, connected: bool) {
    info!(
        node_id = node_id,
        dispatchers = dispatchers,
        connected = connected,
        "HA replication started"
    );
}

/// Log service stop
///
/// # Arguments
///
/// * `flushed` - Records published during the drain
/// * `discarded` - Records dropped when the grace period ran out
pub fn log_service_stopped(flushed: u64, discarded: usize) {
    if discarded == 0 {
        info!(flushed = flushed, "HA replication stopped, queue drained");
    } else {
        warn!(
            flushed = flushed,
            discarded = discarded,
            "HA replication stopped, pending records discarded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let sa = SaIdentifier::new(3);
        log_store_connected("redis://10.0.0.5:6379/0", 1);
        log_connect_failed("memory", "connection refused");
        log_backoff_scheduled(2, Duration::from_millis(200));
        log_connection_lost("reset by peer");
        log_batch_published(sa, 1, 4);
        log_publish_failed(sa, 4, "timeout");
        log_eviction(sa, EventKind::StateChanged, 2);
        log_shed(sa, EventKind::MessageObserved, 9);
        log_contract_violation("ike_rekey", "old == new");
        log_hook_panicked("ike_updown");
        log_seal_failed(sa, "AES-GCM encryption failed");
        log_encode_fallback(sa, EventKind::KeysDerived);
        log_dropped_after_close(sa, EventKind::Established);
        log_service_started("gw-a", 1, false);
        log_service_stopped(10, 0);
        log_service_stopped(10, 2);
    }
}
