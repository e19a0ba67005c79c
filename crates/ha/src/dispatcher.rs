//! Dispatcher tasks
//!
//! Move batches from the [`ReplicationQueue`] to the [`StoreClient`]. Each
//! dispatcher parks while the store is down and while no SA is ready, so
//! an idle or disconnected node costs nothing.

use crate::logging;
use crate::metrics::HaMetrics;
use crate::queue::ReplicationQueue;
use crate::store::{stopped, StoreClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Upper bound on a park, covering a missed queue wakeup
const IDLE_RECHECK: Duration = Duration::from_millis(250);

/// One dispatcher worker
#[derive(Debug, Clone)]
pub struct Dispatcher {
    id: usize,
    queue: Arc<ReplicationQueue>,
    client: Arc<StoreClient>,
    metrics: HaMetrics,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        id: usize,
        queue: Arc<ReplicationQueue>,
        client: Arc<StoreClient>,
        metrics: HaMetrics,
    ) -> Self {
        Self {
            id,
            queue,
            client,
            metrics,
        }
    }

    /// Run until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(dispatcher = self.id, "HA dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = self.client.wait_connected() => {}
            }

            if self.dispatch_one().await {
                continue;
            }

            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = self.queue.wait_for_work() => {}
                _ = tokio::time::sleep(IDLE_RECHECK) => {}
            }
        }
        debug!(dispatcher = self.id, "HA dispatcher stopped");
    }

    /// Publish the next ready batch; false when nothing was ready
    pub async fn dispatch_one(&self) -> bool {
        let Some((sa, batch)) = self.queue.take_next_ready() else {
            return false;
        };
        let first_seq = batch.first().map(|r| r.sequence).unwrap_or_default();
        let last_seq = batch.last().map(|r| r.sequence).unwrap_or_default();

        match self.client.publish(&batch).await {
            Ok(()) => {
                logging::log_batch_published(sa, first_seq, last_seq);
                self.queue.complete(sa);
            }
            Err(e) if e.is_transient() => {
                logging::log_publish_failed(sa, batch.len(), &e.to_string());
                let evicted = self.queue.requeue(sa, batch);
                self.metrics.record_evicted(evicted.len());
                for dropped in &evicted {
                    logging::log_eviction(dropped.sa, dropped.kind, dropped.sequence);
                }
            }
            Err(e) => {
                // Retrying cannot help; drop the batch and keep the SA moving.
                logging::log_publish_failed(sa, batch.len(), &e.to_string());
                self.metrics.record_discarded(batch.len());
                self.queue.complete(sa);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::encoder::EventEncoder;
    use crate::event::{LifecycleEvent, SaIdentifier};
    use crate::store::MemoryStore;

    fn setup(store: &MemoryStore) -> (Dispatcher, Arc<ReplicationQueue>, Arc<StoreClient>, HaMetrics) {
        let metrics = HaMetrics::new();
        let config = StoreConfig {
            host: "127.0.0.1".into(),
            io_timeout_ms: 100,
            ..StoreConfig::default()
        };
        let queue = Arc::new(ReplicationQueue::new(4, 2));
        let client = Arc::new(StoreClient::new(
            config,
            Box::new(store.transport()),
            metrics.clone(),
        ));
        let dispatcher = Dispatcher::new(0, Arc::clone(&queue), Arc::clone(&client), metrics.clone());
        (dispatcher, queue, client, metrics)
    }

    fn enqueue(queue: &ReplicationQueue, sa: u32, count: usize) {
        let encoder = EventEncoder::new("gw-a");
        for _ in 0..count {
            let event = LifecycleEvent::Established {
                sa: SaIdentifier::new(sa),
                up: true,
            };
            queue.enqueue(event.sa(), false, |seq| encoder.encode(&event, seq));
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_batch() {
        let store = MemoryStore::new();
        let (dispatcher, queue, client, metrics) = setup(&store);
        client.connect().await.unwrap();

        enqueue(&queue, 1, 3);
        assert!(dispatcher.dispatch_one().await);
        assert!(dispatcher.dispatch_one().await);
        assert!(!dispatcher.dispatch_one().await);

        assert_eq!(store.write_log(), vec!["sa:1:1", "sa:1:2", "sa:1:3"]);
        assert!(queue.is_idle());
        assert_eq!(metrics.snapshot().records_published, 3);
    }

    #[tokio::test]
    async fn test_failed_dispatch_requeues() {
        let store = MemoryStore::new();
        let (dispatcher, queue, client, metrics) = setup(&store);
        client.connect().await.unwrap();

        enqueue(&queue, 1, 2);
        store.fail_next_writes(1);
        assert!(dispatcher.dispatch_one().await);

        assert!(store.is_empty());
        assert_eq!(queue.pending_len(), 2);
        assert!(!client.is_connected());
        assert_eq!(metrics.snapshot().publish_failures, 1);

        client.connect().await.unwrap();
        assert!(dispatcher.dispatch_one().await);
        assert_eq!(store.write_log(), vec!["sa:1:1", "sa:1:2"]);
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let store = MemoryStore::new();
        let (dispatcher, queue, client, _) = setup(&store);
        client.connect().await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(stop_rx));

        enqueue(&queue, 1, 3);
        enqueue(&queue, 2, 1);
        tokio::time::timeout(Duration::from_secs(2), queue.wait_idle())
            .await
            .expect("queue never drained");
        assert_eq!(store.len(), 4);

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
