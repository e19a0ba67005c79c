//! Store transport abstraction.
//!
//! The [`StoreClient`](super::StoreClient) owns connection state, timeouts
//! and backoff. A transport only knows how to open a connection and write a
//! batch of key/value pairs.

use crate::event::ReplicationRecord;
use crate::Result;

/// One key/value pair as written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// `sa:{sa_id}:{sequence}`
    pub key: String,
    /// Serialized record.
    pub value: Vec<u8>,
}

impl StoreEntry {
    /// Serializes a record into its store entry.
    pub fn from_record(record: &ReplicationRecord) -> Result<Self> {
        Ok(Self {
            key: record.store_key(),
            value: record.to_bytes()?,
        })
    }
}

/// Connection to the shared store.
///
/// Implementations are driven by one caller at a time.
#[async_trait::async_trait]
pub trait StoreTransport: Send {
    /// Opens (or reopens) the connection.
    async fn connect(&mut self) -> Result<()>;

    /// Writes all entries or none of them.
    ///
    /// Writing an entry whose key already exists must succeed and leave
    /// the stored value unchanged: the first writer of a key wins.
    async fn write_batch(&mut self, entries: &[StoreEntry]) -> Result<()>;

    /// Drops the connection. Must not fail.
    async fn close(&mut self);

    /// Short human readable description for logs.
    fn describe(&self) -> String;
}
