//! Storage backend trait definition.
//!
//! This module defines [`StorageBackend`], the versioned key-value contract a
//! distributed ticket store has to satisfy. Ticket registries build their
//! domain semantics (records, child indexes, tombstones) on top of it.
//!
//! # Design
//!
//! - **Keys and values are bytes**: no assumptions about serialization format
//! - **Versioned values**: every write assigns a new version, which callers pass back as a
//!   [`Precondition`] to perform compare-and-swap
//! - **Prefix scans**: ordered enumeration of a key space
//! - **Atomic batches**: multi-key conditional writes via [`WriteBatch`]
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Evaluate all batch preconditions before applying any write
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError)
//! 4. Run the [`conformance`](crate::conformance) suite against it
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    batch::WriteBatch,
    error::StorageResult,
    types::{Precondition, Versioned, VersionedEntry},
};

/// Abstract versioned key-value store.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and to serialize
/// conflicting writes to the same key: of two writes carrying the same
/// [`Precondition::Version`], at most one succeeds.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a value and its version |
/// | [`put`](StorageBackend::put) | Conditional write, optional TTL |
/// | [`delete`](StorageBackend::delete) | Conditional delete |
/// | [`scan_prefix`](StorageBackend::scan_prefix) | Ordered enumeration of a prefix |
/// | [`commit`](StorageBackend::commit) | Atomic multi-key batch |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use sso_ticket_storage::{MemoryBackend, Precondition, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// let v1 = backend.put(b"key".to_vec(), b"one".to_vec(), Precondition::Absent, None).await.unwrap();
/// let v2 = backend.put(b"key".to_vec(), b"two".to_vec(), Precondition::Version(v1), None).await.unwrap();
/// assert!(v2 > v1);
///
/// // A stale version no longer matches.
/// let stale = backend.put(b"key".to_vec(), b"three".to_vec(), Precondition::Version(v1), None).await;
/// assert!(stale.is_err());
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value and its version.
    ///
    /// Returns `Ok(None)` if the key does not exist or its TTL has elapsed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Versioned>>;

    /// Stores a value if `precondition` holds, returning the new version.
    ///
    /// A `ttl` makes the key expire; writing without a TTL clears any
    /// previous expiry.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict): the precondition does not
    ///   hold.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        precondition: Precondition,
        ttl: Option<Duration>,
    ) -> StorageResult<u64>;

    /// Deletes a key if `precondition` holds.
    ///
    /// Returns whether a live value was removed. Deleting an absent key
    /// under [`Precondition::Any`] returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict): the precondition does not
    ///   hold.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8], precondition: Precondition) -> StorageResult<bool>;

    /// Returns every live entry whose key starts with `prefix`, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<VersionedEntry>>;

    /// Applies a [`WriteBatch`] atomically.
    ///
    /// All preconditions are evaluated against the state before the batch;
    /// if any fails, nothing is written and
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) names the
    /// first failing key. Operations are applied in batch order, so a later
    /// operation on the same key wins.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Verifies that the backend can serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
