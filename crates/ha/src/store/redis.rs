//! Redis transport.
//!
//! Each batch is sent as one `MULTI`/`EXEC` pipeline of `SET ... NX`
//! commands, so a batch is applied completely or not at all and a key,
//! once written, is never overwritten. Retried batches are harmless.

use super::transport::{StoreEntry, StoreTransport};
use crate::config::StoreConfig;
use crate::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::IntoConnectionInfo;

/// Redis-backed [`StoreTransport`].
pub struct RedisTransport {
    host: String,
    port: u16,
    password: Option<String>,
    database: i64,
    connection: Option<MultiplexedConnection>,
}

impl RedisTransport {
    /// Creates a transport for the configured store. Does not connect.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.as_ref().map(|p| p.expose().to_string()),
            database: config.database,
            connection: None,
        }
    }

    fn client(&self) -> Result<redis::Client> {
        let mut info = (self.host.as_str(), self.port).into_connection_info()?;
        info.redis.db = self.database;
        info.redis.password = self.password.clone();
        Ok(redis::Client::open(info)?)
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl StoreTransport for RedisTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connection = None;

        let client = self.client()?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await?;

        self.connection = Some(connection);
        Ok(())
    }

    async fn write_batch(&mut self, entries: &[StoreEntry]) -> Result<()> {
        let connection = self.connection.as_mut().ok_or(Error::NotConnected)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.cmd("SET")
                .arg(&entry.key)
                .arg(entry.value.as_slice())
                .arg("NX")
                .ignore();
        }

        let result = pipe.query_async::<_, ()>(connection).await;
        if result.is_err() {
            // The multiplexed connection may be half-dead; force a reconnect.
            self.connection = None;
        }
        result.map_err(Error::from)
    }

    async fn close(&mut self) {
        self.connection = None;
    }

    fn describe(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}
