//! Conformance test suite for [`StorageBackend`] implementations.
//!
//! Async check functions validating that a backend satisfies the versioned
//! key-value contract the ticket registry depends on. Every backend runs the
//! same suite with a fresh instance per check:
//!
//! ```no_run
//! use sso_ticket_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn crud_get_returns_none_for_missing_key() {
//!     conformance::crud_get_returns_none_for_missing_key(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | get/put/delete semantics and versions |
//! | CAS | `Absent` and `Version` preconditions |
//! | Scan | `scan_prefix` ordering and boundaries |
//! | TTL | expiring writes |
//! | Batch | all-or-nothing commits |
//! | Concurrent | exactly-one-winner under contention |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    assert_conflict,
    backend::StorageBackend,
    batch::WriteBatch,
    error::StorageError,
    types::Precondition,
};

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<B: StorageBackend>(backend: &B) {
    let result = backend.get(b"nonexistent").await.expect("get should not error on missing key");
    assert_eq!(result, None, "missing key should return None");
}

/// `put` then `get` returns the value and the version `put` reported.
pub async fn crud_put_then_get_returns_value_and_version<B: StorageBackend>(backend: &B) {
    let version =
        backend.put(b"k1".to_vec(), b"v1".to_vec(), Precondition::Any, None).await.expect("put");
    let stored = backend.get(b"k1").await.expect("get").expect("key should exist");
    assert_eq!(stored.value, Bytes::from("v1"));
    assert_eq!(stored.version, version);
}

/// Every successful write yields a strictly larger version.
pub async fn crud_versions_increase<B: StorageBackend>(backend: &B) {
    let mut last = 0;
    for i in 0..10u8 {
        let version =
            backend.put(b"k".to_vec(), vec![i], Precondition::Any, None).await.expect("put");
        assert!(version > last, "version {version} should exceed {last}");
        last = version;
    }
}

/// `delete` reports whether a live value was removed.
pub async fn crud_delete_reports_removal<B: StorageBackend>(backend: &B) {
    assert!(!backend.delete(b"ghost", Precondition::Any).await.expect("delete missing"));

    backend.put(b"k2".to_vec(), b"val".to_vec(), Precondition::Any, None).await.expect("put");
    assert!(backend.delete(b"k2", Precondition::Any).await.expect("delete"));
    assert_eq!(backend.get(b"k2").await.expect("get after delete"), None);
}

/// Keys are byte-level distinct: `"key"` and `"key\x00"` are different.
pub async fn crud_keys_are_byte_distinct<B: StorageBackend>(backend: &B) {
    backend.put(b"key".to_vec(), b"a".to_vec(), Precondition::Any, None).await.expect("put key");
    backend
        .put(b"key\x00".to_vec(), b"b".to_vec(), Precondition::Any, None)
        .await
        .expect("put key+null");
    let a = backend.get(b"key").await.expect("get key").map(|v| v.value);
    let b = backend.get(b"key\x00").await.expect("get key+null").map(|v| v.value);
    assert_eq!(a, Some(Bytes::from("a")));
    assert_eq!(b, Some(Bytes::from("b")));
}

// ============================================================================
// CAS
// ============================================================================

/// `Absent` succeeds once and conflicts afterwards.
pub async fn cas_absent_rejects_existing_key<B: StorageBackend>(backend: &B) {
    backend
        .put(b"once".to_vec(), b"1".to_vec(), Precondition::Absent, None)
        .await
        .expect("first insert");
    let second = backend.put(b"once".to_vec(), b"2".to_vec(), Precondition::Absent, None).await;
    assert_conflict!(second, "second insert-if-absent");

    let stored = backend.get(b"once").await.expect("get").expect("exists");
    assert_eq!(stored.value, Bytes::from("1"), "conflicting write must not land");
}

/// `Version` succeeds against the current version only.
pub async fn cas_version_rejects_stale_version<B: StorageBackend>(backend: &B) {
    let v1 = backend.put(b"cas".to_vec(), b"1".to_vec(), Precondition::Any, None).await.expect("put");
    let v2 = backend
        .put(b"cas".to_vec(), b"2".to_vec(), Precondition::Version(v1), None)
        .await
        .expect("cas with current version");

    let stale = backend.put(b"cas".to_vec(), b"3".to_vec(), Precondition::Version(v1), None).await;
    assert_conflict!(stale, "cas with stale version");

    let stale_delete = backend.delete(b"cas", Precondition::Version(v1)).await;
    assert_conflict!(stale_delete, "delete with stale version");

    assert!(backend.delete(b"cas", Precondition::Version(v2)).await.expect("delete"));
}

/// `Version` on a missing key conflicts.
pub async fn cas_version_on_missing_key_conflicts<B: StorageBackend>(backend: &B) {
    let result = backend.put(b"missing".to_vec(), b"x".to_vec(), Precondition::Version(1), None).await;
    assert_conflict!(result);
    assert_eq!(backend.get(b"missing").await.expect("get"), None);
}

// ============================================================================
// Scan
// ============================================================================

/// `scan_prefix` returns matching keys in order and nothing outside the prefix.
pub async fn scan_prefix_is_ordered_and_bounded<B: StorageBackend>(backend: &B) {
    for key in [b"c/p/3".as_slice(), b"c/p/1", b"c/q/1", b"c/p/2", b"c/pp/1", b"t/p"] {
        backend.put(key.to_vec(), Vec::new(), Precondition::Any, None).await.expect("put");
    }

    let keys: Vec<Bytes> =
        backend.scan_prefix(b"c/p/").await.expect("scan").into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![Bytes::from("c/p/1"), Bytes::from("c/p/2"), Bytes::from("c/p/3")]);
}

/// An empty prefix scan of an empty store returns nothing.
pub async fn scan_empty_store_returns_empty<B: StorageBackend>(backend: &B) {
    assert!(backend.scan_prefix(b"").await.expect("scan").is_empty());
}

// ============================================================================
// TTL
// ============================================================================

/// A key past its TTL is absent for reads, scans and preconditions.
pub async fn ttl_expired_key_is_absent<B: StorageBackend>(backend: &B) {
    backend
        .put(b"ttl".to_vec(), b"v".to_vec(), Precondition::Any, Some(Duration::from_millis(50)))
        .await
        .expect("put with ttl");
    assert!(backend.get(b"ttl").await.expect("get before expiry").is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(backend.get(b"ttl").await.expect("get after expiry"), None);
    assert!(backend.scan_prefix(b"ttl").await.expect("scan").is_empty());
    backend
        .put(b"ttl".to_vec(), b"again".to_vec(), Precondition::Absent, None)
        .await
        .expect("expired key counts as absent");
}

/// Rewriting without a TTL clears the previous expiry.
pub async fn ttl_overwrite_without_ttl_persists<B: StorageBackend>(backend: &B) {
    backend
        .put(b"k".to_vec(), b"v".to_vec(), Precondition::Any, Some(Duration::from_millis(50)))
        .await
        .expect("put with ttl");
    backend.put(b"k".to_vec(), b"v2".to_vec(), Precondition::Any, None).await.expect("overwrite");

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(backend.get(b"k").await.expect("get").is_some(), "ttl should have been cleared");
}

// ============================================================================
// Batch
// ============================================================================

/// A batch whose preconditions hold applies every operation.
pub async fn batch_applies_all_operations<B: StorageBackend>(backend: &B) {
    let parent =
        backend.put(b"t/p".to_vec(), b"p0".to_vec(), Precondition::Any, None).await.expect("put");
    backend.put(b"t/old".to_vec(), b"o".to_vec(), Precondition::Any, None).await.expect("put");

    let mut batch = WriteBatch::new();
    batch
        .put(b"t/c".to_vec(), b"c".to_vec(), Precondition::Absent)
        .put(b"t/p".to_vec(), b"p1".to_vec(), Precondition::Version(parent))
        .delete(b"t/old".to_vec(), Precondition::Any);
    backend.commit(batch).await.expect("commit");

    assert!(backend.get(b"t/c").await.expect("get").is_some());
    assert_eq!(backend.get(b"t/p").await.expect("get").map(|v| v.value), Some(Bytes::from("p1")));
    assert_eq!(backend.get(b"t/old").await.expect("get"), None);
}

/// One failed precondition leaves the store untouched and names the key.
pub async fn batch_is_all_or_nothing<B: StorageBackend>(backend: &B) {
    backend.put(b"a".to_vec(), b"1".to_vec(), Precondition::Any, None).await.expect("put");

    let mut batch = WriteBatch::new();
    batch
        .put(b"b".to_vec(), b"2".to_vec(), Precondition::Absent)
        .delete(b"a".to_vec(), Precondition::Any)
        .check(b"a".to_vec(), Precondition::Absent);
    let result = backend.commit(batch).await;

    match result {
        Err(StorageError::Conflict { key }) => assert_eq!(key, "a"),
        other => panic!("expected conflict on key a, got {other:?}"),
    }
    assert_eq!(backend.get(b"b").await.expect("get"), None, "no write may land");
    assert!(backend.get(b"a").await.expect("get").is_some(), "no delete may land");
}

// ============================================================================
// Concurrent
// ============================================================================

/// Of many writers racing with the same version, exactly one wins.
pub async fn concurrent_cas_has_single_winner<B: StorageBackend + 'static>(backend: Arc<B>) {
    const WRITERS: usize = 16;

    let version =
        backend.put(b"race".to_vec(), b"0".to_vec(), Precondition::Any, None).await.expect("put");

    let mut set = tokio::task::JoinSet::new();
    for writer in 0..WRITERS {
        let backend = Arc::clone(&backend);
        set.spawn(async move {
            backend
                .put(
                    b"race".to_vec(),
                    writer.to_string().into_bytes(),
                    Precondition::Version(version),
                    None,
                )
                .await
        });
    }

    let mut winners = 0;
    while let Some(joined) = set.join_next().await {
        match joined.expect("writer should not panic") {
            Ok(_) => winners += 1,
            Err(StorageError::Conflict { .. }) => {},
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one compare-and-swap must succeed");
}

/// Runs every check against fresh backends produced by `factory`.
pub async fn run_all<B, F>(factory: F)
where
    B: StorageBackend + 'static,
    F: Fn() -> B,
{
    crud_get_returns_none_for_missing_key(&factory()).await;
    crud_put_then_get_returns_value_and_version(&factory()).await;
    crud_versions_increase(&factory()).await;
    crud_delete_reports_removal(&factory()).await;
    crud_keys_are_byte_distinct(&factory()).await;
    cas_absent_rejects_existing_key(&factory()).await;
    cas_version_rejects_stale_version(&factory()).await;
    cas_version_on_missing_key_conflicts(&factory()).await;
    scan_prefix_is_ordered_and_bounded(&factory()).await;
    scan_empty_store_returns_empty(&factory()).await;
    ttl_expired_key_is_absent(&factory()).await;
    ttl_overwrite_without_ttl_persists(&factory()).await;
    batch_applies_all_operations(&factory()).await;
    batch_is_all_or_nothing(&factory()).await;
    concurrent_cas_has_single_winner(Arc::new(factory())).await;
}
