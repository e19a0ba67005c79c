//! Store client
//!
//! Owns the single connection to the shared store and the rules around it:
//!
//! - Every connect and publish is bounded by a timeout, so a dead store
//!   never stalls a dispatcher for longer than the configured bound.
//! - A transient publish failure drops the connection; the reconnect task
//!   then retries with exponential backoff until the store comes back.
//! - Connection state is broadcast on a `watch` channel so dispatchers can
//!   park until the store is usable instead of polling.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting ──ok──► Connected
//!       ▲                          │                  │
//!       └──────────── err ─────────┘                  │
//!       └──────────── publish failure / disconnect() ─┘
//! ```

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod transport;

pub use memory::{MemoryStore, MemoryTransport};
#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;
pub use transport::{StoreEntry, StoreTransport};

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::config::StoreConfig;
use crate::event::ReplicationRecord;
use crate::logging;
use crate::metrics::HaMetrics;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Store connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Publishing possible
    Connected,
}

/// Client for the shared store
pub struct StoreClient {
    config: StoreConfig,
    transport: tokio::sync::Mutex<Box<dyn StoreTransport>>,
    state: watch::Sender<ConnectionState>,
    backoff: Mutex<ExponentialBackoff>,
    backoff_active: AtomicBool,
    ever_connected: AtomicBool,
    metrics: HaMetrics,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .finish()
    }
}

impl StoreClient {
    /// Create a disconnected client
    pub fn new(config: StoreConfig, transport: Box<dyn StoreTransport>, metrics: HaMetrics) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = ExponentialBackoff::new(BackoffPolicy::from_store(&config));
        Self {
            config,
            transport: tokio::sync::Mutex::new(transport),
            state,
            backoff: Mutex::new(backoff),
            backoff_active: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            metrics,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether publishing is currently possible
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether the client is waiting out a reconnect delay
    pub fn backoff_active(&self) -> bool {
        self.backoff_active.load(Ordering::Relaxed)
    }

    /// Wait until the client is connected
    pub async fn wait_connected(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await;
    }

    /// Open the connection
    ///
    /// Bounded by `connect_timeout_ms`. Success resets the backoff.
    pub async fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.state.send_replace(ConnectionState::Connecting);

        let result = match tokio::time::timeout(
            self.config.connect_timeout(),
            transport.connect(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "connect",
                after_ms: self.config.connect_timeout_ms,
            }),
        };

        match result {
            Ok(()) => {
                let attempt = {
                    let mut backoff = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
                    let attempt = backoff.attempt() + 1;
                    backoff.reset();
                    attempt
                };
                self.backoff_active.store(false, Ordering::Relaxed);
                self.metrics.record_connect(true);
                if self.ever_connected.swap(true, Ordering::Relaxed) {
                    self.metrics.record_reconnect();
                }
                self.state.send_replace(ConnectionState::Connected);
                logging::log_store_connected(&transport.describe(), attempt);
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                self.metrics.record_connect(false);
                self.state.send_replace(ConnectionState::Disconnected);
                logging::log_connect_failed(&transport.describe(), &e.to_string());
                Err(e)
            }
        }
    }

    /// Write a batch of records
    ///
    /// All records are written or none are. Bounded by `io_timeout_ms`. A
    /// transient failure drops the connection and leaves reconnecting to
    /// [`run_reconnect`](Self::run_reconnect).
    pub async fn publish(&self, records: &[ReplicationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let entries = records
            .iter()
            .map(StoreEntry::from_record)
            .collect::<Result<Vec<_>>>()?;

        let mut transport = self.transport.lock().await;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let result = match tokio::time::timeout(
            self.config.io_timeout(),
            transport.write_batch(&entries),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "publish",
                after_ms: self.config.io_timeout_ms,
            }),
        };

        match result {
            Ok(()) => {
                self.metrics.record_published(records.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                if e.is_transient() {
                    transport.close().await;
                    self.state.send_replace(ConnectionState::Disconnected);
                    logging::log_connection_lost(&e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        transport.close().await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Reconnect loop
    ///
    /// Waits for the connection to drop, sleeps the next backoff delay and
    /// tries again, forever, until `shutdown` turns true.
    pub async fn run_reconnect(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut state = self.state.subscribe();
        loop {
            let lost = tokio::select! {
                lost = disconnected(&mut state) => lost,
                _ = stopped(&mut shutdown) => false,
            };
            if !lost {
                break;
            }

            let (delay, attempt) = {
                let mut backoff = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
                let delay = backoff.next_backoff();
                (delay, backoff.attempt() + 1)
            };
            self.backoff_active.store(true, Ordering::Relaxed);
            logging::log_backoff_scheduled(attempt, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }

            // Failure is logged and counted by connect(); state stays Disconnected.
            let _ = self.connect().await;
        }
        self.backoff_active.store(false, Ordering::Relaxed);
    }
}

async fn disconnected(state: &mut watch::Receiver<ConnectionState>) -> bool {
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .is_ok()
}

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EventEncoder;
    use crate::event::{LifecycleEvent, SaIdentifier};
    use std::time::Duration;

    fn config() -> StoreConfig {
        StoreConfig {
            host: "127.0.0.1".into(),
            connect_timeout_ms: 100,
            io_timeout_ms: 100,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            ..StoreConfig::default()
        }
    }

    fn client(store: &MemoryStore) -> (Arc<StoreClient>, HaMetrics) {
        let metrics = HaMetrics::new();
        let client = StoreClient::new(config(), Box::new(store.transport()), metrics.clone());
        (Arc::new(client), metrics)
    }

    fn records(sa: u32, count: u64) -> Vec<ReplicationRecord> {
        let encoder = EventEncoder::new("gw-a");
        (1..=count)
            .map(|seq| {
                encoder.encode(
                    &LifecycleEvent::Established {
                        sa: SaIdentifier::new(sa),
                        up: true,
                    },
                    seq,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let store = MemoryStore::new();
        let (client, _) = client(&store);

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.publish(&records(1, 1)).await, Err(Error::NotConnected));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.publish(&records(1, 2)).await.unwrap();
        assert_eq!(store.write_log(), vec!["sa:1:1", "sa:1:2"]);
    }

    #[tokio::test]
    async fn test_publish_idempotent() {
        let store = MemoryStore::new();
        let (client, metrics) = client(&store);
        client.connect().await.unwrap();

        let batch = records(4, 3);
        client.publish(&batch).await.unwrap();
        client.publish(&batch).await.unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.records_for(SaIdentifier::new(4)), batch);
        assert_eq!(metrics.snapshot().publish_batches, 2);
    }

    #[tokio::test]
    async fn test_publish_failure_drops_connection() {
        let store = MemoryStore::new();
        let (client, metrics) = client(&store);
        client.connect().await.unwrap();

        store.set_reachable(false);
        let err = client.publish(&records(1, 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(metrics.snapshot().publish_failures, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_publish_timeout() {
        let store = MemoryStore::new();
        let (client, _) = client(&store);
        client.connect().await.unwrap();

        store.set_write_delay(Some(Duration::from_millis(500)));
        let err = client.publish(&records(1, 1)).await.unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                operation: "publish",
                after_ms: 100
            }
        );
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_counted() {
        let store = MemoryStore::new();
        let (client, metrics) = client(&store);

        store.fail_next_connects(1);
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.connect().await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_attempts, 2);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.reconnects, 0);
    }

    #[tokio::test]
    async fn test_reconnect_after_failures() {
        let store = MemoryStore::new();
        let (client, metrics) = client(&store);
        store.fail_next_connects(3);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&client).run_reconnect(stop_rx));

        assert!(client.connect().await.is_err());
        tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
            .await
            .expect("client never reconnected");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_failures, 3);
        assert_eq!(snapshot.connect_attempts, 4);
        assert!(!client.backoff_active());

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reconnect task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_lost_connection() {
        let store = MemoryStore::new();
        let (client, metrics) = client(&store);
        client.connect().await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&client).run_reconnect(stop_rx));

        store.set_reachable(false);
        assert!(client.publish(&records(1, 1)).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_connected());

        store.set_reachable(true);
        tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
            .await
            .expect("client never reconnected");
        assert_eq!(metrics.snapshot().reconnects, 1);

        client.publish(&records(1, 1)).await.unwrap();
        assert_eq!(store.len(), 1);

        stop_tx.send_replace(true);
        task.await.unwrap();
    }
}
