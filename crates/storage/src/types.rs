//! Common types used across storage operations.

use bytes::Bytes;

/// A stored value together with the version that wrote it.
///
/// Versions are assigned by the backend, strictly increase across all writes
/// to the same backend, and change on every successful write to a key. They
/// are the etag used to implement optimistic compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// The value bytes.
    pub value: Bytes,

    /// Version assigned by the backend when the value was written.
    pub version: u64,
}

impl Versioned {
    /// Creates a new versioned value.
    pub fn new(value: Bytes, version: u64) -> Self {
        Self { value, version }
    }
}

/// A key together with its versioned value, returned from prefix scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedEntry {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,

    /// Version assigned when the value was written.
    pub version: u64,
}

impl VersionedEntry {
    /// Creates a new entry.
    pub fn new(key: Bytes, value: Bytes, version: u64) -> Self {
        Self { key, value, version }
    }
}

/// Condition a write requires of the currently stored state.
///
/// A key whose TTL has elapsed is treated as absent for every precondition.
///
/// # Examples
///
/// ```
/// use sso_ticket_storage::Precondition;
///
/// assert!(Precondition::Any.holds(None));
/// assert!(Precondition::Absent.holds(None));
/// assert!(!Precondition::Absent.holds(Some(3)));
/// assert!(Precondition::Version(3).holds(Some(3)));
/// assert!(!Precondition::Version(3).holds(None));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Unconditional write.
    #[default]
    Any,
    /// The key must not exist (insert-if-absent).
    Absent,
    /// The key must exist and still carry this version.
    Version(u64),
}

impl Precondition {
    /// Returns whether the precondition holds for the given current version
    /// (`None` when the key is absent).
    #[must_use]
    pub fn holds(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::Absent, Some(_)) => false,
            (Self::Version(expected), Some(actual)) => expected == actual,
            (Self::Version(_), None) => false,
        }
    }
}
