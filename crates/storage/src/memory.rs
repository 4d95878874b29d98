//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], an in-memory implementation of
//! [`StorageBackend`] used for tests, development, and single-node
//! deployments of the storage-backed ticket registry.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for prefix scans
//! - **Versioned writes**: A single counter stamps every write
//! - **TTL support**: Expired keys are invisible immediately and removed by a background task
//!
//! # Example
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, Precondition, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.put(b"greeting".to_vec(), b"hello".to_vec(), Precondition::Any, None).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().value.as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - No replication or distributed features
//! - TTL cleanup runs every second, so physical removal is not precise

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    batch::{BatchOperation, WriteBatch},
    error::{StorageError, StorageResult},
    types::{Precondition, Versioned, VersionedEntry},
};

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Best-effort signal; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<Vec<u8>, Entry>,
    last_version: u64,
}

impl State {
    fn live_version(&self, key: &[u8], now: Instant) -> Option<u64> {
        self.entries.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.version)
    }

    fn check(&self, key: &[u8], precondition: Precondition, now: Instant) -> StorageResult<()> {
        if precondition.holds(self.live_version(key, now)) {
            Ok(())
        } else {
            Err(StorageError::conflict(key))
        }
    }

    fn write(&mut self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> u64 {
        self.last_version += 1;
        let version = self.last_version;
        self.entries.insert(
            key,
            Entry { value: Bytes::from(value), version, expires_at: ttl.map(|ttl| now + ttl) },
        );
        version
    }

    fn remove(&mut self, key: &[u8], now: Instant) -> bool {
        self.entries.remove(key).is_some_and(|entry| entry.is_live(now))
    }
}

/// In-memory storage backend using a [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
///
/// # Shutdown
///
/// The background TTL cleanup task stops automatically when all clones of
/// the `MemoryBackend` are dropped. [`shutdown`](Self::shutdown) stops it
/// explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    /// When the last clone drops the sender is dropped, closing the watch
    /// channel and ending the cleanup task.
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates a new in-memory storage backend.
    ///
    /// This spawns a background task on the current Tokio runtime that
    /// periodically removes expired keys.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            state: Arc::new(RwLock::new(State::default())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let weak_state = Arc::downgrade(&backend.state);
        tokio::spawn(async move {
            cleanup_expired_keys(weak_state, shutdown_rx).await;
        });

        backend
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    ///
    /// The backend stays usable; expired keys remain invisible but are no
    /// longer physically removed.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of physically stored entries, including expired ones that the
    /// cleanup task has not removed yet.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.state.read().entries.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop removing expired keys once per second.
///
/// Holds only a weak reference so that it never keeps the store alive.
async fn cleanup_expired_keys(
    state: std::sync::Weak<RwLock<State>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let Some(state) = state.upgrade() else {
            return;
        };

        let now = Instant::now();
        let mut guard = state.write();
        let before = guard.entries.len();
        guard.entries.retain(|_, entry| entry.is_live(now));
        let removed = before - guard.entries.len();
        if removed > 0 {
            tracing::trace!(removed, "removed expired storage entries");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Versioned>> {
        let now = Instant::now();
        let state = self.state.read();
        Ok(state
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Versioned::new(entry.value.clone(), entry.version)))
    }

    async fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        precondition: Precondition,
        ttl: Option<Duration>,
    ) -> StorageResult<u64> {
        let now = Instant::now();
        let mut state = self.state.write();
        state.check(&key, precondition, now)?;
        Ok(state.write(key, value, ttl, now))
    }

    async fn delete(&self, key: &[u8], precondition: Precondition) -> StorageResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write();
        state.check(key, precondition, now)?;
        Ok(state.remove(key, now))
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<VersionedEntry>> {
        let now = Instant::now();
        let state = self.state.read();
        Ok(state
            .entries
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| {
                VersionedEntry::new(Bytes::copy_from_slice(key), entry.value.clone(), entry.version)
            })
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        let now = Instant::now();
        let mut state = self.state.write();

        for operation in batch.operations() {
            state.check(operation.key(), operation.precondition(), now)?;
        }

        for operation in batch.into_operations() {
            match operation {
                BatchOperation::Put { key, value, ttl, .. } => {
                    state.write(key, value, ttl, now);
                },
                BatchOperation::Delete { key, .. } => {
                    state.remove(&key, now);
                },
                BatchOperation::Check { .. } => {},
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Acquiring the read lock proves the store is not deadlocked.
        let _unused = self.state.read();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let backend = MemoryBackend::new();

        let version =
            backend.put(b"key1".to_vec(), b"value1".to_vec(), Precondition::Any, None).await.unwrap();
        let value = backend.get(b"key1").await.unwrap();
        assert_eq!(value, Some(Versioned::new(Bytes::from("value1"), version)));

        assert!(backend.delete(b"key1", Precondition::Any).await.unwrap());
        assert_eq!(backend.get(b"key1").await.unwrap(), None);
        assert!(!backend.delete(b"key1", Precondition::Any).await.unwrap());
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let backend = MemoryBackend::new();

        let a = backend.put(b"a".to_vec(), b"1".to_vec(), Precondition::Any, None).await.unwrap();
        let b = backend.put(b"b".to_vec(), b"1".to_vec(), Precondition::Any, None).await.unwrap();
        let a2 = backend.put(b"a".to_vec(), b"2".to_vec(), Precondition::Any, None).await.unwrap();

        assert!(a < b);
        assert!(b < a2);
    }

    #[tokio::test]
    async fn test_version_precondition() {
        let backend = MemoryBackend::new();
        let v1 =
            backend.put(b"k".to_vec(), b"one".to_vec(), Precondition::Absent, None).await.unwrap();

        let result = backend.put(b"k".to_vec(), b"dup".to_vec(), Precondition::Absent, None).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));

        let v2 = backend
            .put(b"k".to_vec(), b"two".to_vec(), Precondition::Version(v1), None)
            .await
            .unwrap();
        let stale =
            backend.put(b"k".to_vec(), b"three".to_vec(), Precondition::Version(v1), None).await;
        assert!(matches!(stale, Err(StorageError::Conflict { .. })));

        let value = backend.get(b"k").await.unwrap().unwrap();
        assert_eq!(value.version, v2);
        assert_eq!(value.value, Bytes::from("two"));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_bounded() {
        let backend = MemoryBackend::new();
        for key in [b"t/b".as_slice(), b"t/a", b"c/a", b"t/c", b"u/a"] {
            backend.put(key.to_vec(), b"v".to_vec(), Precondition::Any, None).await.unwrap();
        }

        let keys: Vec<Bytes> =
            backend.scan_prefix(b"t/").await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![Bytes::from("t/a"), Bytes::from("t/b"), Bytes::from("t/c")]);
    }

    #[tokio::test]
    async fn test_expired_key_is_invisible_and_absent() {
        let backend = MemoryBackend::new();
        backend
            .put(b"gone".to_vec(), b"v".to_vec(), Precondition::Any, Some(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(backend.get(b"gone").await.unwrap(), None);
        assert!(backend.scan_prefix(b"go").await.unwrap().is_empty());
        backend.put(b"gone".to_vec(), b"again".to_vec(), Precondition::Absent, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let existing =
            backend.put(b"x".to_vec(), b"1".to_vec(), Precondition::Any, None).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put(b"y".to_vec(), b"2".to_vec(), Precondition::Absent)
            .delete(b"x".to_vec(), Precondition::Version(existing + 100));
        let result = backend.commit(batch).await;

        assert!(matches!(result, Err(StorageError::Conflict { ref key }) if key == "x"));
        assert_eq!(backend.get(b"y").await.unwrap(), None);
        assert!(backend.get(b"x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_check_does_not_write() {
        let backend = MemoryBackend::new();
        let version =
            backend.put(b"p".to_vec(), b"1".to_vec(), Precondition::Any, None).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.check(b"p".to_vec(), Precondition::Version(version)).put(
            b"q".to_vec(),
            b"2".to_vec(),
            Precondition::Absent,
        );
        backend.commit(batch).await.unwrap();

        assert_eq!(backend.get(b"p").await.unwrap().unwrap().version, version);
        assert!(backend.get(b"q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_entries() {
        let backend = MemoryBackend::new();
        backend
            .put(b"ttl".to_vec(), b"v".to_vec(), Precondition::Any, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(backend.stored_len(), 1);

        sleep(Duration::from_millis(1500)).await;

        assert_eq!(backend.stored_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_cleanup_task() {
        let backend = MemoryBackend::new();
        backend
            .put(b"ttl".to_vec(), b"v".to_vec(), Precondition::Any, Some(Duration::from_millis(10)))
            .await
            .unwrap();

        backend.shutdown();
        sleep(Duration::from_millis(1500)).await;

        // Expired but not physically removed.
        assert_eq!(backend.stored_len(), 1);
        assert_eq!(backend.get(b"ttl").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let backend1 = MemoryBackend::new();
        let backend2 = backend1.clone();

        backend1.put(b"key".to_vec(), b"value".to_vec(), Precondition::Any, None).await.unwrap();

        let value = backend2.get(b"key").await.unwrap();
        assert_eq!(value.map(|v| v.value), Some(Bytes::from("value")));
    }

    #[tokio::test]
    async fn test_health_check() {
        let backend = MemoryBackend::new();
        assert!(backend.health_check().await.is_ok());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Every key returned by `scan_prefix` carries the prefix, and every
            /// stored key with the prefix is returned.
            #[test]
            fn scan_prefix_matches_filter(
                keys in proptest::collection::btree_set(proptest::collection::vec(0u8..4, 1..6), 0..24),
                prefix in proptest::collection::vec(0u8..4, 0..3),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let backend = MemoryBackend::new();
                    for key in &keys {
                        backend.put(key.clone(), b"v".to_vec(), Precondition::Any, None).await.unwrap();
                    }

                    let scanned: Vec<Vec<u8>> = backend
                        .scan_prefix(&prefix)
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|entry| entry.key.to_vec())
                        .collect();
                    let expected: Vec<Vec<u8>> =
                        keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();

                    prop_assert_eq!(scanned, expected);
                    Ok(())
                })?;
            }
        }
    }
}
