//! Atomic multi-key write batches.
//!
//! A [`WriteBatch`] accumulates conditional writes, deletes and pure checks
//! which a backend applies with [`StorageBackend::commit`](crate::StorageBackend::commit):
//! every precondition is evaluated first, under the backend's write lock (or
//! inside its native transaction), and the writes are applied only if all of
//! them hold.
//!
//! # Examples
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, Precondition, StorageBackend, WriteBatch};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//! let parent = backend.put(b"t/parent".to_vec(), b"p".to_vec(), Precondition::Absent, None).await.unwrap();
//!
//! let mut batch = WriteBatch::new();
//! batch
//!     .put(b"t/child".to_vec(), b"c".to_vec(), Precondition::Absent)
//!     .put(b"t/parent".to_vec(), b"p".to_vec(), Precondition::Version(parent))
//!     .put(b"c/parent/child".to_vec(), Vec::new(), Precondition::Any);
//! backend.commit(batch).await.unwrap();
//! # });
//! ```

use std::time::Duration;

use crate::types::Precondition;

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    /// Stores a value, optionally expiring after `ttl`.
    Put {
        /// The key to store.
        key: Vec<u8>,
        /// The value to associate with the key.
        value: Vec<u8>,
        /// Required state of the key before the write.
        precondition: Precondition,
        /// Optional time-to-live.
        ttl: Option<Duration>,
    },
    /// Removes a key. Removing an absent key under [`Precondition::Any`] is a no-op.
    Delete {
        /// The key to remove.
        key: Vec<u8>,
        /// Required state of the key before the delete.
        precondition: Precondition,
    },
    /// Asserts a precondition without writing.
    Check {
        /// The key to inspect.
        key: Vec<u8>,
        /// Required state of the key.
        precondition: Precondition,
    },
}

impl BatchOperation {
    /// The key this operation targets.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } | Self::Check { key, .. } => key,
        }
    }

    /// The precondition this operation requires.
    #[must_use]
    pub fn precondition(&self) -> Precondition {
        match self {
            Self::Put { precondition, .. }
            | Self::Delete { precondition, .. }
            | Self::Check { precondition, .. } => *precondition,
        }
    }
}

/// An ordered list of operations committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    operations: Vec<BatchOperation>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a conditional write without expiry.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, precondition: Precondition) -> &mut Self {
        self.operations.push(BatchOperation::Put { key, value, precondition, ttl: None });
        self
    }

    /// Queues a conditional write that expires after `ttl`.
    pub fn put_with_ttl(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        precondition: Precondition,
        ttl: Duration,
    ) -> &mut Self {
        self.operations.push(BatchOperation::Put { key, value, precondition, ttl: Some(ttl) });
        self
    }

    /// Queues a conditional delete.
    pub fn delete(&mut self, key: Vec<u8>, precondition: Precondition) -> &mut Self {
        self.operations.push(BatchOperation::Delete { key, precondition });
        self
    }

    /// Queues a precondition check that writes nothing.
    pub fn check(&mut self, key: Vec<u8>, precondition: Precondition) -> &mut Self {
        self.operations.push(BatchOperation::Check { key, precondition });
        self
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The queued operations in insertion order.
    #[must_use]
    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    /// Consumes the batch, yielding its operations.
    #[must_use]
    pub fn into_operations(self) -> Vec<BatchOperation> {
        self.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chains_in_order() {
        let mut batch = WriteBatch::new();
        batch
            .put(b"a".to_vec(), b"1".to_vec(), Precondition::Absent)
            .delete(b"b".to_vec(), Precondition::Version(4))
            .check(b"c".to_vec(), Precondition::Any)
            .put_with_ttl(b"d".to_vec(), Vec::new(), Precondition::Any, Duration::from_secs(5));

        assert_eq!(batch.len(), 4);
        let keys: Vec<&[u8]> = batch.operations().iter().map(BatchOperation::key).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c", b"d"]);
        assert_eq!(batch.operations()[1].precondition(), Precondition::Version(4));
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert!(batch.into_operations().is_empty());
    }
}
