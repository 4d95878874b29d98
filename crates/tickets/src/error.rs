//! Ticket error types.
//!
//! Expected outcomes of the ticket lifecycle ([`TicketError::NotFound`],
//! [`TicketError::Expired`], [`TicketError::AlreadyConsumed`],
//! [`TicketError::ServiceMismatch`]) are kept distinct for audit, while
//! [`TicketError::protocol_message`] collapses them to one user-facing
//! message so that callers never expose a ticket-validity oracle.

use sso_ticket_storage::StorageError;
use thiserror::Error;

use crate::ticket::{TicketId, TicketKind};

/// Result type alias for ticket operations.
pub type TicketResult<T> = Result<T, TicketError>;

/// Message shown at the protocol boundary for every invalid-ticket outcome.
pub const AUTHENTICATION_REQUIRED: &str = "authentication required, please log in again";

/// Message shown at the protocol boundary while the backend is unavailable.
pub const SERVICE_UNAVAILABLE: &str = "service temporarily unavailable, please try again";

/// Message shown at the protocol boundary for internal faults.
pub const INTERNAL_ERROR: &str = "internal error";

/// Errors produced by ticket registries and the ticket service.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// The ticket is absent, or was expired and purged.
    #[error("Ticket not found: {id}")]
    NotFound {
        /// The requested ticket.
        id: TicketId,
    },

    /// The ticket is present but its expiration policy says it is expired.
    #[error("Ticket expired: {id}")]
    Expired {
        /// The expired ticket.
        id: TicketId,
    },

    /// A one-time ticket was already used.
    #[error("Ticket already consumed: {id}")]
    AlreadyConsumed {
        /// The consumed ticket.
        id: TicketId,
    },

    /// The presented service differs from the service the ticket is bound to.
    #[error("Service mismatch for ticket {id}: bound to {expected}, presented {presented}")]
    ServiceMismatch {
        /// The ticket that was presented.
        id: TicketId,
        /// The service the ticket was issued for.
        expected: String,
        /// The service that presented it.
        presented: String,
    },

    /// A ticket with this id already exists. Indicates a broken uniqueness
    /// guarantee in the id generator.
    #[error("Duplicate ticket identifier: {id}")]
    DuplicateIdentifier {
        /// The colliding ticket id.
        id: TicketId,
    },

    /// The operation received a ticket of the wrong kind.
    #[error("Ticket {id} is a {actual} ticket, expected {expected}")]
    InvalidKind {
        /// The offending ticket.
        id: TicketId,
        /// Its actual kind.
        actual: TicketKind,
        /// What the operation accepts.
        expected: &'static str,
    },

    /// Transient storage failure.
    #[error("Ticket backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
        /// The underlying storage error.
        #[source]
        source: Option<StorageError>,
    },

    /// A stored ticket record could not be encoded or decoded.
    #[error("Ticket codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
        /// The underlying serialization error.
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },
}

impl TicketError {
    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(id: &TicketId) -> Self {
        Self::NotFound { id: id.clone() }
    }

    /// Creates an `Expired` error.
    #[must_use]
    pub fn expired(id: &TicketId) -> Self {
        Self::Expired { id: id.clone() }
    }

    /// Creates an `AlreadyConsumed` error.
    #[must_use]
    pub fn already_consumed(id: &TicketId) -> Self {
        Self::AlreadyConsumed { id: id.clone() }
    }

    /// Creates a `ServiceMismatch` error.
    #[must_use]
    pub fn service_mismatch(
        id: &TicketId,
        expected: impl Into<String>,
        presented: impl Into<String>,
    ) -> Self {
        Self::ServiceMismatch { id: id.clone(), expected: expected.into(), presented: presented.into() }
    }

    /// Creates a `DuplicateIdentifier` error.
    #[must_use]
    pub fn duplicate(id: &TicketId) -> Self {
        Self::DuplicateIdentifier { id: id.clone() }
    }

    /// Creates an `InvalidKind` error.
    #[must_use]
    pub fn invalid_kind(id: &TicketId, actual: TicketKind, expected: &'static str) -> Self {
        Self::InvalidKind { id: id.clone(), actual, expected }
    }

    /// Creates a `BackendUnavailable` error without a storage source.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable { message: message.into(), source: None }
    }

    /// Creates a `Codec` error from a serialization failure.
    #[must_use]
    pub fn codec(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Codec { message: message.into(), source: Some(source) }
    }

    /// Creates a `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Returns `true` for failures worth retrying with backoff.
    ///
    /// Only idempotent reads may be retried blindly. A failed consume must
    /// be confirmed with a fresh read first: its first attempt may have
    /// succeeded on the backend.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Returns `true` for faults that indicate corrupted state or a broken
    /// guarantee, which must be logged loudly and never silently retried.
    #[must_use]
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, Self::DuplicateIdentifier { .. } | Self::Codec { .. })
    }

    /// The message to show at the protocol boundary.
    ///
    /// Every invalid-ticket outcome maps to the same text.
    #[must_use]
    pub fn protocol_message(&self) -> &'static str {
        match self {
            Self::NotFound { .. }
            | Self::Expired { .. }
            | Self::AlreadyConsumed { .. }
            | Self::ServiceMismatch { .. }
            | Self::InvalidKind { .. } => AUTHENTICATION_REQUIRED,
            Self::BackendUnavailable { .. } => SERVICE_UNAVAILABLE,
            Self::DuplicateIdentifier { .. } | Self::Codec { .. } | Self::Config { .. } => {
                INTERNAL_ERROR
            },
        }
    }
}

impl From<StorageError> for TicketError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Serialization { message, .. } => Self::Codec { message, source: None },
            other => Self::BackendUnavailable { message: other.to_string(), source: Some(other) },
        }
    }
}
