//! Key layout and record encoding for storage-backed registries.
//!
//! Every ticket id maps to exactly one key:
//!
//! ```text
//! t/<sha256(id) as lowercase hex>
//! ```
//!
//! Hashing bounds key length and keeps ids with arbitrary suffixes from
//! colliding with the prefix structure. The value is a JSON
//! [`StoredRecord`]: either the live ticket or the tombstone of a consumed
//! one. Parents reference children through the child set inside their own
//! record, so a single conditional write covers both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{TicketError, TicketResult},
    ticket::{Ticket, TicketId},
};

/// Prefix shared by every ticket record key.
pub const TICKET_PREFIX: &[u8] = b"t/";

/// Backend key of the record for `id`.
#[must_use]
pub fn ticket_key(id: &TicketId) -> Vec<u8> {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let mut key = Vec::with_capacity(TICKET_PREFIX.len() + digest.len() * 2);
    key.extend_from_slice(TICKET_PREFIX);
    key.extend_from_slice(hex::encode(digest).as_bytes());
    key
}

/// Value stored under a ticket key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoredRecord {
    /// A ticket that can still be read and used.
    Live {
        /// The ticket.
        ticket: Ticket,
    },
    /// A one-time ticket that has been used up or burned.
    Consumed {
        /// The consumed ticket's id.
        id: TicketId,
        /// When it was consumed.
        consumed_at: DateTime<Utc>,
    },
}

impl StoredRecord {
    /// The live ticket, if this record holds one.
    #[must_use]
    pub fn into_live(self) -> Option<Ticket> {
        match self {
            Self::Live { ticket } => Some(ticket),
            Self::Consumed { .. } => None,
        }
    }
}

/// Serializes a record.
///
/// # Errors
///
/// Returns [`TicketError::Codec`] if serialization fails.
pub fn encode(record: &StoredRecord) -> TicketResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| TicketError::codec("failed to encode ticket record", e))
}

/// Deserializes a record.
///
/// # Errors
///
/// Returns [`TicketError::Codec`] for bytes that are not a valid record.
pub fn decode(bytes: &[u8]) -> TicketResult<StoredRecord> {
    serde_json::from_slice(bytes).map_err(|e| TicketError::codec("failed to decode ticket record", e))
}
