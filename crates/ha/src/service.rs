//! HA replication service
//!
//! Wires the pieces together and owns their lifecycle:
//!
//! ```text
//!  engine bus ──hooks──► HaListener ──enqueue──► ReplicationQueue
//!                                                      │
//!                                     Dispatcher x N ◄─┘
//!                                           │ publish
//!                                           ▼
//!                     reconnect task ──► StoreClient ──► shared store
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ha::{Bus, HaConfig, HaService};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> fynx_ha::Result<()> {
//! let config = HaConfig::builder()
//!     .with_store_host("10.0.0.5")
//!     .with_node_id("gw-a")
//!     .build()?;
//!
//! let bus = Arc::new(Bus::new());
//! let service = HaService::new(config)?;
//! service.start(bus.clone()).await?;
//!
//! // ... engine runs, emitting events on `bus` ...
//!
//! let report = service.stop().await?;
//! println!("flushed {} records", report.flushed);
//! # Ok(())
//! # }
//! ```

use crate::bus::{BusListener, ListenerRegistry};
use crate::config::HaConfig;
use crate::dispatcher::Dispatcher;
use crate::encoder::EventEncoder;
use crate::listener::HaListener;
use crate::logging;
use crate::metrics::{HaMetrics, MetricsSnapshot};
use crate::queue::{QueueStats, ReplicationQueue};
use crate::seal::KeySealer;
use crate::store::{ConnectionState, StoreClient, StoreTransport};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Extra time granted to background tasks beyond their own I/O bound
const TASK_STOP_MARGIN: Duration = Duration::from_millis(250);

/// Outcome of [`HaService::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records published between the stop request and the end of the drain
    pub flushed: u64,
    /// Records dropped because the grace period ran out
    pub discarded: usize,
}

/// Replication health for operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    /// Store connection state
    pub connection: ConnectionState,
    /// A reconnect delay is being waited out
    pub backoff_active: bool,
    /// At least one record was evicted or shed
    pub degraded: bool,
    /// Queue occupancy
    pub queue: QueueStats,
    /// Counters
    pub metrics: MetricsSnapshot,
}

struct Running {
    registry: Arc<dyn ListenerRegistry>,
    registered: Arc<dyn BusListener>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// HA replication service
pub struct HaService {
    config: HaConfig,
    metrics: HaMetrics,
    queue: Arc<ReplicationQueue>,
    client: Arc<StoreClient>,
    listener: Arc<HaListener>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for HaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaService")
            .field("node_id", &self.config.node_id)
            .field("client", &self.client)
            .field("queue", &self.queue.stats())
            .finish()
    }
}

impl HaService {
    /// Create a service publishing to the configured Redis store
    #[cfg(feature = "redis")]
    pub fn new(config: HaConfig) -> Result<Self> {
        let transport = crate::store::RedisTransport::new(&config.store);
        Self::with_transport(config, Box::new(transport))
    }

    /// Create a service over an arbitrary store transport
    pub fn with_transport(config: HaConfig, transport: Box<dyn StoreTransport>) -> Result<Self> {
        config.validate()?;

        let sealer = config
            .seal_key
            .as_ref()
            .map(|key| KeySealer::from_hex(key.expose()))
            .transpose()?;

        let metrics = HaMetrics::new();
        let queue = Arc::new(ReplicationQueue::from_config(&config.store));
        let client = Arc::new(StoreClient::new(
            config.store.clone(),
            transport,
            metrics.clone(),
        ));
        let listener = Arc::new(HaListener::new(
            EventEncoder::new(config.node_id.clone()),
            Arc::clone(&queue),
            sealer,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            metrics,
            queue,
            client,
            listener,
            running: Mutex::new(None),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    /// The bus listener, for hosts that register it themselves
    pub fn listener(&self) -> Arc<HaListener> {
        Arc::clone(&self.listener)
    }

    /// Shared metrics
    pub fn metrics(&self) -> &HaMetrics {
        &self.metrics
    }

    /// Store client
    pub fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }

    /// Connect, start background tasks and register on `registry`
    ///
    /// An unreachable store is not an error: the service starts degraded
    /// and the reconnect task keeps trying.
    pub async fn start(&self, registry: Arc<dyn ListenerRegistry>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        self.queue.reopen();
        let connected = self.client.connect().await.is_ok();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.dispatchers + 1);
        tasks.push(tokio::spawn(
            Arc::clone(&self.client).run_reconnect(shutdown_rx.clone()),
        ));
        for id in 0..self.config.dispatchers {
            let dispatcher = Dispatcher::new(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.client),
                self.metrics.clone(),
            );
            tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
        }

        let registered: Arc<dyn BusListener> = self.listener.clone();
        registry.add_listener(Arc::clone(&registered));

        logging::log_service_started(&self.config.node_id, self.config.dispatchers, connected);
        *running = Some(Running {
            registry,
            registered,
            shutdown,
            tasks,
        });
        Ok(())
    }

    /// Unregister, drain within the grace period, then stop everything
    pub async fn stop(&self) -> Result<ShutdownReport> {
        let mut state = self.running.lock().await;
        let Some(running) = state.take() else {
            return Err(Error::NotRunning);
        };

        running.registry.remove_listener(&running.registered);
        self.queue.close();
        let published_before = self.metrics.snapshot().records_published;

        if tokio::time::timeout(self.config.shutdown_grace(), self.queue.wait_idle())
            .await
            .is_err()
        {
            warn!(
                pending = self.queue.pending_len(),
                grace_ms = self.config.shutdown_grace_ms,
                "HA drain did not finish within grace period"
            );
        }

        running.shutdown.send_replace(true);
        let task_bound = self
            .config
            .store
            .io_timeout()
            .max(self.config.store.connect_timeout())
            + TASK_STOP_MARGIN;
        let aborted = join_within(running.tasks, task_bound).await;
        if aborted > 0 {
            warn!(aborted, "HA background tasks aborted at shutdown");
        }

        let discarded = self.queue.discard_all();
        self.metrics.record_discarded(discarded);
        self.client.disconnect().await;

        let flushed = self
            .metrics
            .snapshot()
            .records_published
            .saturating_sub(published_before);
        logging::log_service_stopped(flushed, discarded);
        Ok(ShutdownReport { flushed, discarded })
    }

    /// Whether `start` has been called without a matching `stop`
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Current replication health
    pub fn health(&self) -> HealthReport {
        let metrics = self.metrics.snapshot();
        HealthReport {
            connection: self.client.state(),
            backoff_active: self.client.backoff_active(),
            degraded: metrics.degraded,
            queue: self.queue.stats(),
            metrics,
        }
    }
}

/// Join `tasks` against one shared deadline; abort whatever is left
///
/// Returns the number of aborted tasks.
async fn join_within(tasks: Vec<JoinHandle<()>>, bound: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + bound;
    let mut aborted = 0;
    for task in tasks {
        let abort = task.abort_handle();
        if tokio::time::timeout_at(deadline, task).await.is_err() {
            abort.abort();
            aborted += 1;
        }
    }
    aborted
}
