//! In-process store.
//!
//! Behaves like the shared store as seen through one connection: batches
//! are applied atomically, existing keys are never overwritten, and the whole
//! thing can be made unreachable or made to fail a number of operations.
//! Used by tests and by single-node deployments that want the replication
//! stream without a store.

use super::transport::{StoreEntry, StoreTransport};
use crate::event::{ReplicationRecord, SaIdentifier, KEY_PREFIX};
use crate::{Error, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    write_log: Vec<String>,
    unreachable: bool,
    fail_connects: u32,
    fail_writes: u32,
    write_delay: Option<Duration>,
    connects: u64,
    batches: u64,
    generation: u64,
}

/// Shared in-memory key/value store.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty, reachable store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New connection handle to this store.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            store: self.clone(),
            generation: None,
        }
    }

    /// Makes the store (un)reachable.
    ///
    /// Going unreachable breaks every open connection.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        if !reachable && !state.unreachable {
            state.generation += 1;
        }
        state.unreachable = !reachable;
    }

    /// Fails the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_connects = count;
    }

    /// Fails the next `count` batch writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_writes = count;
    }

    /// Delays every batch write.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.lock().write_delay = delay;
    }

    /// Raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().entries.get(key).cloned()
    }

    /// Decoded record stored under `key`.
    pub fn record(&self, key: &str) -> Option<ReplicationRecord> {
        self.get(key)
            .and_then(|value| ReplicationRecord::from_bytes(&value).ok())
    }

    /// Records of one SA in sequence order.
    pub fn records_for(&self, sa: SaIdentifier) -> Vec<ReplicationRecord> {
        let prefix = format!("{}:{}:", KEY_PREFIX, sa);
        let mut records: Vec<_> = self
            .lock()
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, value)| ReplicationRecord::from_bytes(value).ok())
            .collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in the order they were first written.
    pub fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }

    /// Successful connects.
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Applied batches.
    pub fn batch_count(&self) -> u64 {
        self.lock().batches
    }
}

/// Connection handle to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransport {
    store: MemoryStore,
    generation: Option<u64>,
}

#[async_trait::async_trait]
impl StoreTransport for MemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.store.lock();
        self.generation = None;

        if state.unreachable {
            return Err(Error::Transport("connection refused".into()));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::Transport("connection refused".into()));
        }

        state.connects += 1;
        self.generation = Some(state.generation);
        Ok(())
    }

    async fn write_batch(&mut self, entries: &[StoreEntry]) -> Result<()> {
        let delay = self.store.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.store.lock();
        let Some(generation) = self.generation else {
            return Err(Error::NotConnected);
        };
        if state.unreachable || generation != state.generation {
            self.generation = None;
            return Err(Error::Transport("connection reset by peer".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(Error::Transport("write failed".into()));
        }

        let MemoryState {
            entries: stored,
            write_log,
            batches,
            ..
        } = &mut *state;
        for entry in entries {
            if let Entry::Vacant(slot) = stored.entry(entry.key.clone()) {
                slot.insert(entry.value.clone());
                write_log.push(entry.key.clone());
            }
        }
        *batches += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.generation = None;
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &[u8]) -> StoreEntry {
        StoreEntry {
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_write_requires_connect() {
        let store = MemoryStore::new();
        let mut transport = store.transport();

        let result = transport.write_batch(&[entry("sa:1:1", b"x")]).await;
        assert_eq!(result, Err(Error::NotConnected));

        transport.connect().await.unwrap();
        transport.write_batch(&[entry("sa:1:1", b"x")]).await.unwrap();
        assert_eq!(store.get("sa:1:1"), Some(b"x".to_vec()));
        assert_eq!(store.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_noop() {
        let store = MemoryStore::new();
        let mut transport = store.transport();
        transport.connect().await.unwrap();

        let batch = [entry("sa:1:1", b"a"), entry("sa:1:2", b"b")];
        transport.write_batch(&batch).await.unwrap();
        transport.write_batch(&batch).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.write_log(), vec!["sa:1:1", "sa:1:2"]);
        assert_eq!(store.batch_count(), 2);
    }

    #[tokio::test]
    async fn test_existing_key_not_overwritten() {
        let store = MemoryStore::new();
        let mut transport = store.transport();
        transport.connect().await.unwrap();

        transport.write_batch(&[entry("sa:7:1", b"up")]).await.unwrap();
        transport
            .write_batch(&[entry("sa:7:1", b"message"), entry("sa:7:2", b"b")])
            .await
            .unwrap();

        assert_eq!(store.get("sa:7:1"), Some(b"up".to_vec()));
        assert_eq!(store.get("sa:7:2"), Some(b"b".to_vec()));
        assert_eq!(store.write_log(), vec!["sa:7:1", "sa:7:2"]);
    }

    #[tokio::test]
    async fn test_failed_write_applies_nothing() {
        let store = MemoryStore::new();
        let mut transport = store.transport();
        transport.connect().await.unwrap();

        store.fail_next_writes(1);
        let batch = [entry("sa:1:1", b"a"), entry("sa:1:2", b"b")];
        assert!(transport.write_batch(&batch).await.is_err());
        assert!(store.is_empty());

        transport.write_batch(&batch).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_breaks_connection() {
        let store = MemoryStore::new();
        let mut transport = store.transport();
        transport.connect().await.unwrap();

        store.set_reachable(false);
        let err = transport.write_batch(&[entry("sa:1:1", b"a")]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(transport.connect().await.is_err());

        // Coming back does not revive the old connection
        store.set_reachable(true);
        assert_eq!(
            transport.write_batch(&[entry("sa:1:1", b"a")]).await,
            Err(Error::NotConnected)
        );
        transport.connect().await.unwrap();
        transport.write_batch(&[entry("sa:1:1", b"a")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let store = MemoryStore::new();
        let mut transport = store.transport();

        store.fail_next_connects(2);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(store.connect_count(), 1);
        assert_eq!(transport.describe(), "memory");
    }
}
