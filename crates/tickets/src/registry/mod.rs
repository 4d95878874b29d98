//! Ticket registry contract and implementations.
//!
//! A [`TicketRegistry`] stores tickets and provides the atomic operations the
//! ticket lifecycle depends on:
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`add`](TicketRegistry::add) | Insert a new ticket and link it to its parent |
//! | [`fetch`](TicketRegistry::fetch) / [`get`](TicketRegistry::get) | Read a valid ticket, purging it if expired |
//! | [`consume`](TicketRegistry::consume) | Atomically validate and use up a one-time ticket |
//! | [`update`](TicketRegistry::update) | Persist usage stamps and service records |
//! | [`delete`](TicketRegistry::delete) | Remove a single ticket |
//! | [`delete_with_children`](TicketRegistry::delete_with_children) | Remove a ticket and its whole subtree |
//! | [`delete_if_expired`](TicketRegistry::delete_if_expired) | Remove a subtree only if its root is still expired |
//! | [`prune_children`](TicketRegistry::prune_children) | Drop child links to tickets that are gone |
//! | [`get_all`](TicketRegistry::get_all) | Enumerate stored tickets for sweeps |
//!
//! # Expiry
//!
//! A ticket counts as expired when its own policy says so, or when any of
//! its ancestors is missing or expired. No child outlives its ancestor,
//! even before the expiration sweep has run.
//!
//! # Implementations
//!
//! - [`MemoryTicketRegistry`]: a single-node concurrent map.
//! - [`StorageTicketRegistry`]: any [`StorageBackend`](sso_ticket_storage::StorageBackend),
//!   for registries shared between nodes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{TicketError, TicketResult},
    ticket::{Ticket, TicketId},
};

pub mod codec;
pub mod memory;
pub mod storage;

pub use memory::MemoryTicketRegistry;
pub use storage::StorageTicketRegistry;

/// Storage contract for tickets.
///
/// Implementations must be safe for concurrent use. `consume` is
/// linearizable per ticket id; `delete_with_children` is observed
/// atomically by every operation that starts after it returns.
#[async_trait]
pub trait TicketRegistry: Send + Sync {
    /// Inserts a new ticket.
    ///
    /// A ticket with a parent is atomically added to the parent's child set.
    /// STs go under TGTs, PTs under PGTs, and PGTs under either.
    ///
    /// # Errors
    ///
    /// - [`TicketError::DuplicateIdentifier`] if the id is live or tombstoned.
    /// - [`TicketError::NotFound`] / [`TicketError::Expired`] (naming the parent) if the parent is
    ///   not a valid granting ticket.
    /// - [`TicketError::InvalidKind`] if the parent cannot own a child of this kind.
    async fn add(&self, ticket: Ticket) -> TicketResult<()>;

    /// Returns a valid ticket.
    ///
    /// An expired ticket is deleted together with its descendants and
    /// reported as [`TicketError::Expired`].
    async fn fetch(&self, id: &TicketId) -> TicketResult<Ticket>;

    /// Like [`fetch`](Self::fetch), but reports expired tickets as
    /// [`TicketError::NotFound`].
    async fn get(&self, id: &TicketId) -> TicketResult<Ticket> {
        match self.fetch(id).await {
            Err(TicketError::Expired { id }) => Err(TicketError::NotFound { id }),
            other => other,
        }
    }

    /// Atomically validates and uses a one-time ticket for `service`.
    ///
    /// Existence, expiry, kind, service binding and the use itself happen as
    /// one step. A ticket whose policy is exhausted by this use, or whose
    /// policy sets no use limit, is replaced by a tombstone and unlinked
    /// from its parent. A mismatched service also burns the ticket.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`], [`TicketError::Expired`],
    /// [`TicketError::AlreadyConsumed`], [`TicketError::ServiceMismatch`] or
    /// [`TicketError::InvalidKind`]. Of any number of concurrent callers,
    /// at most one succeeds per permitted use.
    async fn consume(&self, id: &TicketId, service: &str) -> TicketResult<Ticket>;

    /// Persists usage stamps and service records of `ticket`, returning the
    /// stored result.
    ///
    /// Usage stamps never move backwards and the child set is owned by the
    /// registry, so concurrent updates cannot lose children. A consumed or
    /// deleted ticket is never brought back.
    async fn update(&self, ticket: &Ticket) -> TicketResult<Ticket>;

    /// Removes a single ticket and unlinks it from its parent. Returns
    /// whether a live ticket existed.
    async fn delete(&self, id: &TicketId) -> TicketResult<bool>;

    /// Removes a ticket and every descendant.
    ///
    /// Returns the removed live tickets, the root first. Tombstones found
    /// in the subtree are purged but not returned. A missing root yields an
    /// empty list.
    async fn delete_with_children(&self, id: &TicketId) -> TicketResult<Vec<Ticket>>;

    /// Removes a ticket and every descendant if the ticket is expired at
    /// the time of the call.
    ///
    /// The expiry check and the removal are one atomic step: a ticket
    /// refreshed after the caller last read it survives. Returns the removed
    /// live tickets, the root first; empty when the ticket is missing or
    /// still valid.
    async fn delete_if_expired(&self, id: &TicketId) -> TicketResult<Vec<Ticket>>;

    /// Drops child ids of `id` that no longer name a live ticket. Returns
    /// how many links were dropped; a missing ticket yields zero.
    async fn prune_children(&self, id: &TicketId) -> TicketResult<usize>;

    /// Every stored live ticket, expired or not. Tombstones are excluded.
    async fn get_all(&self) -> TicketResult<Vec<Ticket>>;

    /// Whether tickets are lost when the process exits.
    fn is_volatile(&self) -> bool {
        false
    }
}

#[async_trait]
impl<R: TicketRegistry + ?Sized> TicketRegistry for Arc<R> {
    async fn add(&self, ticket: Ticket) -> TicketResult<()> {
        (**self).add(ticket).await
    }

    async fn fetch(&self, id: &TicketId) -> TicketResult<Ticket> {
        (**self).fetch(id).await
    }

    async fn get(&self, id: &TicketId) -> TicketResult<Ticket> {
        (**self).get(id).await
    }

    async fn consume(&self, id: &TicketId, service: &str) -> TicketResult<Ticket> {
        (**self).consume(id, service).await
    }

    async fn update(&self, ticket: &Ticket) -> TicketResult<Ticket> {
        (**self).update(ticket).await
    }

    async fn delete(&self, id: &TicketId) -> TicketResult<bool> {
        (**self).delete(id).await
    }

    async fn delete_with_children(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        (**self).delete_with_children(id).await
    }

    async fn delete_if_expired(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        (**self).delete_if_expired(id).await
    }

    async fn prune_children(&self, id: &TicketId) -> TicketResult<usize> {
        (**self).prune_children(id).await
    }

    async fn get_all(&self) -> TicketResult<Vec<Ticket>> {
        (**self).get_all().await
    }

    fn is_volatile(&self) -> bool {
        (**self).is_volatile()
    }
}
