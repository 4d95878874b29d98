//! Ticket identifier generation.
//!
//! Ids look like `ST-42-1f0c...e9` (optionally followed by `-<suffix>`): a
//! kind prefix for diagnostics, a process-local sequence number, and 160
//! bits from a cryptographically secure generator so that ids cannot be
//! predicted from previously observed ones.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::{RngCore, TryRngCore, rngs::OsRng};

use crate::{
    error::{TicketError, TicketResult},
    ticket::{TicketId, TicketKind},
};

/// Number of random bytes in every id.
pub const RANDOM_BYTES: usize = 20;

/// Generates unguessable, collision-resistant ticket ids.
///
/// Safe for concurrent use: the sequence is atomic and randomness comes from
/// the thread-local CSPRNG, seeded from the operating system.
#[derive(Debug)]
pub struct TicketIdGenerator {
    sequence: AtomicU64,
    suffix: Option<String>,
}

impl TicketIdGenerator {
    /// Creates a generator, verifying that the operating system entropy
    /// source works.
    ///
    /// `suffix` (typically a node name) is appended to every id.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] if the entropy source is unavailable
    /// or the suffix contains characters other than ASCII alphanumerics,
    /// `.` and `_`.
    pub fn new(suffix: Option<String>) -> TicketResult<Self> {
        let mut sample = [0u8; RANDOM_BYTES];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| TicketError::config(format!("entropy source unavailable: {e}")))?;

        if let Some(suffix) = &suffix {
            let valid = !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
            if !valid {
                return Err(TicketError::config(format!("invalid ticket id suffix: {suffix:?}")));
            }
        }

        Ok(Self { sequence: AtomicU64::new(1), suffix })
    }

    /// Returns a fresh id for `kind`. Never fails.
    pub fn next(&self, kind: TicketKind) -> TicketId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut random = [0u8; RANDOM_BYTES];
        rand::rng().fill_bytes(&mut random);
        let random = hex::encode(random);

        match &self.suffix {
            Some(suffix) => TicketId::new(format!("{}-{sequence}-{random}-{suffix}", kind.prefix())),
            None => TicketId::new(format!("{}-{sequence}-{random}", kind.prefix())),
        }
    }
}
