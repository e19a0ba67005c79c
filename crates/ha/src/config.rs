//! HA Configuration
//!
//! Store endpoint, bounds and timeouts are always supplied by the hosting
//! process. Only the documented fallbacks below are built in; the store
//! host and the node id have none.
//!
//! | key                        | fallback |
//! |----------------------------|----------|
//! | `store.host`               | required |
//! | `store.port`               | 6379     |
//! | `store.connect_timeout_ms` | 1500     |
//! | `store.io_timeout_ms`      | 1000     |
//! | `store.max_queue_per_sa`   | 32       |
//! | `store.max_batch_size`     | 8        |
//! | `store.initial_backoff_ms` | 100      |
//! | `store.max_backoff_ms`     | 30000    |
//! | `store.password`           | none     |
//! | `store.database`           | 0        |
//! | `node_id`                  | required |
//! | `dispatchers`              | 1        |
//! | `shutdown_grace_ms`        | 2000     |
//! | `seal_key`                 | none     |

use crate::seal::SEAL_KEY_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default store port
pub const DEFAULT_PORT: u16 = 6379;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1500;

/// Default read/write timeout
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Default per-SA queue bound
pub const DEFAULT_MAX_QUEUE_PER_SA: usize = 32;

/// Default records per published batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 8;

/// Default first reconnect delay
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default reconnect delay cap
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default shutdown drain grace period
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// String that is never printed
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Access the secret
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Shared store connection and admission parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store address (hostname or IP)
    pub host: String,

    /// Store port
    pub port: u16,

    /// Connect handshake bound
    pub connect_timeout_ms: u64,

    /// Per-publish read/write bound
    pub io_timeout_ms: u64,

    /// Pending records kept per SA before eviction
    pub max_queue_per_sa: usize,

    /// Records written per store round trip
    pub max_batch_size: usize,

    /// First reconnect delay
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap
    pub max_backoff_ms: u64,

    /// Store password
    pub password: Option<Secret>,

    /// Store database index
    pub database: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            max_queue_per_sa: DEFAULT_MAX_QUEUE_PER_SA,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            password: None,
            database: 0,
        }
    }
}

impl StoreConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read/write timeout as a duration
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("store.host must be set".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("store.port must be in 1-65535".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "store.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(Error::Config("store.io_timeout_ms must be positive".into()));
        }
        if self.max_queue_per_sa == 0 {
            return Err(Error::Config(
                "store.max_queue_per_sa must be positive".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("store.max_batch_size must be positive".into()));
        }
        if self.max_batch_size > self.max_queue_per_sa {
            return Err(Error::Config(format!(
                "store.max_batch_size ({}) exceeds store.max_queue_per_sa ({})",
                self.max_batch_size, self.max_queue_per_sa
            )));
        }
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "store.initial_backoff_ms must be positive and not above store.max_backoff_ms"
                    .into(),
            ));
        }
        if self.database < 0 {
            return Err(Error::Config("store.database must not be negative".into()));
        }
        Ok(())
    }
}

/// Complete HA subsystem configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Shared store parameters
    pub store: StoreConfig,

    /// Identity of this gateway node, stamped on every record
    pub node_id: String,

    /// Number of dispatcher tasks
    pub dispatchers: usize,

    /// How long `stop()` waits for the queue to drain
    pub shutdown_grace_ms: u64,

    /// Hex encoded AES-256 key for sealing key material
    pub seal_key: Option<Secret>,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            node_id: String::new(),
            dispatchers: 1,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            seal_key: None,
        }
    }
}

impl HaConfig {
    /// Create builder for HA configuration
    pub fn builder() -> HaConfigBuilder {
        HaConfigBuilder::new()
    }

    /// Shutdown grace period as a duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must be set".into()));
        }
        if self.dispatchers == 0 {
            return Err(Error::Config("dispatchers must be positive".into()));
        }
        if let Some(key) = &self.seal_key {
            let key = key.expose().trim();
            if key.len() != SEAL_KEY_LEN * 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "seal_key must be {} hex characters",
                    SEAL_KEY_LEN * 2
                )));
            }
        }
        Ok(())
    }

    /// Build configuration from dotted `key = value` settings
    ///
    /// Unknown keys are rejected so that typos do not silently fall back to
    /// defaults. The result is validated.
    pub fn from_settings<I, K, V>(settings: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = HaConfig::default();
        for (key, value) in settings {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            match key {
                "store.host" => config.store.host = value.to_string(),
                "store.port" => config.store.port = parse(key, value)?,
                "store.connect_timeout_ms" => config.store.connect_timeout_ms = parse(key, value)?,
                "store.io_timeout_ms" => config.store.io_timeout_ms = parse(key, value)?,
                "store.max_queue_per_sa" => config.store.max_queue_per_sa = parse(key, value)?,
                "store.max_batch_size" => config.store.max_batch_size = parse(key, value)?,
                "store.initial_backoff_ms" => config.store.initial_backoff_ms = parse(key, value)?,
                "store.max_backoff_ms" => config.store.max_backoff_ms = parse(key, value)?,
                "store.password" => config.store.password = Some(Secret::new(value)),
                "store.database" => config.store.database = parse(key, value)?,
                "node_id" => config.node_id = value.to_string(),
                "dispatchers" => config.dispatchers = parse(key, value)?,
                "shutdown_grace_ms" => config.shutdown_grace_ms = parse(key, value)?,
                "seal_key" => config.seal_key = Some(Secret::new(value)),
                other => {
                    return Err(Error::Config(format!("unknown setting '{}'", other)));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", value, key)))
}

/// Builder for HaConfig
#[derive(Default)]
pub struct HaConfigBuilder {
    config: HaConfig,
}

impl HaConfigBuilder {
    /// Create new builder with documented fallbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set store host
    pub fn with_store_host(mut self, host: impl Into<String>) -> Self {
        self.config.store.host = host.into();
        self
    }

    /// Set store port
    pub fn with_store_port(mut self, port: u16) -> Self {
        self.config.store.port = port;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.store.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set read/write timeout
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.config.store.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set per-SA queue bound
    pub fn with_max_queue_per_sa(mut self, max: usize) -> Self {
        self.config.store.max_queue_per_sa = max;
        self
    }

    /// Set batch size
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.config.store.max_batch_size = max;
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.store.initial_backoff_ms = initial.as_millis() as u64;
        self.config.store.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Set store password
    pub fn with_store_password(mut self, password: impl Into<String>) -> Self {
        self.config.store.password = Some(Secret::new(password));
        self
    }

    /// Set store database index
    pub fn with_store_database(mut self, database: i64) -> Self {
        self.config.store.database = database;
        self
    }

    /// Set node identity
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.node_id = node_id.into();
        self
    }

    /// Set dispatcher count
    pub fn with_dispatchers(mut self, count: usize) -> Self {
        self.config.dispatchers = count;
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set hex encoded seal key
    pub fn with_seal_key(mut self, hex_key: impl Into<String>) -> Self {
        self.config.seal_key = Some(Secret::new(hex_key));
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<HaConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
