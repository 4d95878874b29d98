//! Versioned key-value storage abstraction for the SSO ticket registry.
//!
//! This crate provides the [`StorageBackend`] trait and related types that a
//! shared ticket store has to implement. The storage-backed registry in
//! `sso-tickets` builds ticket records and tombstones on top
//! of this contract; any store offering conditional writes, prefix scans and
//! atomic batches can host it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TicketService                            │
//! │     (grant, validate, proxy, revoke, clean expired)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   TicketRegistry                            │
//! │   MemoryTicketRegistry   │   StorageTicketRegistry<B>       │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                 sso-ticket-storage                          │
//! │              StorageBackend trait                           │
//! │    (get, put, delete, scan_prefix, commit)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ MemoryBackend (single node, tests) │ external stores        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use sso_ticket_storage::{MemoryBackend, Precondition, StorageBackend, WriteBatch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Insert-if-absent
//!     let version = backend.put(b"t/1".to_vec(), b"a".to_vec(), Precondition::Absent, None).await?;
//!
//!     // Compare-and-swap plus a second key, atomically
//!     let mut batch = WriteBatch::new();
//!     batch
//!         .put(b"t/1".to_vec(), b"b".to_vec(), Precondition::Version(version))
//!         .put(b"c/1/2".to_vec(), Vec::new(), Precondition::Absent);
//!     backend.commit(batch).await?;
//!
//!     assert_eq!(backend.scan_prefix(b"c/1/").await?.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. A failed precondition is
//! reported as [`StorageError::Conflict`]; backends map their internal
//! errors to the remaining variants, and [`StorageError::is_transient`]
//! tells callers which failures are worth retrying.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (assertion macros, populated backends) and the
//!   `conformance` suite that every backend implementation should pass.

#![deny(unsafe_code)]

pub mod backend;
pub mod batch;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use batch::{BatchOperation, WriteBatch};
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use types::{Precondition, Versioned, VersionedEntry};
