//! High-availability SA state replication for the Fynx IKEv2 gateway.
//!
//! The active gateway node observes every IKE SA lifecycle event on the
//! engine bus and publishes a self-contained record of it to a shared
//! store, from which a standby node can rebuild the state it needs to take
//! over.
//!
//! ```text
//! negotiation threads ──► HaListener ──► ReplicationQueue ──► Dispatcher ──► StoreClient ──► store
//!        (hooks)          (no I/O)        (per-SA order)       (tokio)        (timeouts,
//!                                                                              backoff)
//! ```
//!
//! # Guarantees
//!
//! - Hooks never block on I/O, never fail the engine and always return
//!   `true`.
//! - For one SA, records reach the store in sequence order. Different SAs
//!   are independent streams.
//! - Delivery is at-least-once; re-publishing a record is a no-op because
//!   every record lives under its own `sa:{sa_id}:{sequence}` key.
//! - Memory is bounded per SA. Under pressure, diagnostic records go
//!   first and key/up-down/rekey records last.
//! - Derived keys never reach the store or the logs in cleartext.
//!
//! # Features
//!
//! - `redis` (default) - Redis store transport
//!
//! # Example
//!
//! ```rust
//! use fynx_ha::store::MemoryStore;
//! use fynx_ha::{Bus, HaConfig, HaService, IkeSa};
//! use std::sync::Arc;
//!
//! struct Sa(u32);
//!
//! impl IkeSa for Sa {
//!     fn unique_id(&self) -> u32 { self.0 }
//!     fn is_initiator(&self) -> bool { true }
//!     fn name(&self) -> &str { "peer-a" }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> fynx_ha::Result<()> {
//! let config = HaConfig::builder()
//!     .with_store_host("127.0.0.1")
//!     .with_node_id("gw-a")
//!     .build()?;
//!
//! let store = MemoryStore::new();
//! let service = HaService::with_transport(config, Box::new(store.transport()))?;
//! let bus = Arc::new(Bus::new());
//! service.start(bus.clone()).await?;
//!
//! bus.ike_updown(&Sa(1), true);
//!
//! service.stop().await?;
//! assert!(store.get("sa:1:1").is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod event;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod seal;
pub mod service;
pub mod store;

pub use bus::{
    AuthMethod, Bus, BusListener, IkeKeys, IkeSa, IkeSaState, ListenerRegistry, MessageMeta,
};
pub use config::{HaConfig, HaConfigBuilder, Secret, StoreConfig};
pub use encoder::EventEncoder;
pub use error::{Error, Result};
pub use event::{
    store_key, Direction, EventKind, KeyMaterialRef, LifecycleEvent, NegotiationRole, Priority,
    ReplicationRecord, SaIdentifier,
};
pub use listener::HaListener;
pub use metrics::{HaMetrics, MetricsSnapshot};
pub use queue::{Admission, ReplicationQueue};
pub use seal::KeySealer;
pub use service::{HaService, HealthReport, ShutdownReport};
pub use store::{ConnectionState, StoreClient, StoreTransport};
