//! In-memory ticket registry.
//!
//! [`MemoryTicketRegistry`] keeps live tickets in a [`HashMap`] behind a
//! single [`parking_lot::RwLock`]. Every multi-step operation (the
//! check-and-use of `consume`, the parent link of `add`, the subtree walk of
//! `delete_with_children`) runs inside one short, synchronous write-locked
//! section, so each is atomic with respect to all others. Reads share the
//! lock.
//!
//! Consumed one-time tickets leave a tombstone in a bounded
//! [`moka::sync::Cache`] so that replays report
//! [`TicketError::AlreadyConsumed`]. A tombstone evicted by capacity
//! pressure degrades a replay to [`TicketError::NotFound`], which still
//! fails.
//!
//! Data is lost when the process exits and is not shared between nodes.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use parking_lot::RwLock;

use super::TicketRegistry;
use crate::{
    clock::Clock,
    config::RegistryConfig,
    error::{TicketError, TicketResult},
    ticket::{Ticket, TicketId},
};

type TicketMap = HashMap<TicketId, Ticket>;

/// Single-node concurrent ticket registry.
pub struct MemoryTicketRegistry {
    tickets: RwLock<TicketMap>,
    tombstones: Cache<TicketId, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl MemoryTicketRegistry {
    /// Creates a registry with default tombstone retention.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::from_valid_config(&RegistryConfig::default(), clock)
    }

    /// Creates a registry using the tombstone settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] if `config` does not validate.
    pub fn with_config(config: &RegistryConfig, clock: Arc<dyn Clock>) -> TicketResult<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config, clock))
    }

    fn from_valid_config(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let tombstones = Cache::builder()
            .max_capacity(config.tombstone_capacity)
            .time_to_live(config.tombstone_ttl)
            .build();
        Self { tickets: RwLock::new(HashMap::new()), tombstones, clock }
    }

    /// Number of stored live tickets, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.read().len()
    }

    /// Returns `true` when no live ticket is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.read().is_empty()
    }

    /// Returns `true` if a tombstone records `id` as consumed.
    #[must_use]
    pub fn is_consumed(&self, id: &TicketId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Removes `id` and its descendants, root first, and unlinks the root
    /// from its parent. Tombstones met on the way are purged.
    fn remove_subtree(&self, map: &mut TicketMap, id: &TicketId) -> Vec<Ticket> {
        let mut removed = Vec::new();
        let mut pending = vec![id.clone()];

        while let Some(next) = pending.pop() {
            match map.remove(&next) {
                Some(ticket) => {
                    if let Some(children) = ticket.child_tickets() {
                        pending.extend(children.iter().rev().cloned());
                    }
                    removed.push(ticket);
                },
                None => self.tombstones.invalidate(&next),
            }
        }

        if let Some(root) = removed.first() {
            unlink(map, root);
        }
        removed
    }
}

/// Drops `child` from its parent's child set, if the parent is stored.
fn unlink(map: &mut TicketMap, child: &Ticket) {
    if let Some(parent) = child.parent().and_then(|parent_id| map.get_mut(parent_id)) {
        parent.remove_child(child.id());
    }
}

/// Whether `ticket` or any of its ancestors is missing or expired.
fn expired_in(map: &TicketMap, ticket: &Ticket, now: DateTime<Utc>) -> bool {
    if ticket.is_expired(now) {
        return true;
    }

    let mut parent = ticket.parent();
    while let Some(parent_id) = parent {
        match map.get(parent_id) {
            Some(ancestor) if !ancestor.is_expired(now) => parent = ancestor.parent(),
            _ => return true,
        }
    }
    false
}

#[async_trait]
impl TicketRegistry for MemoryTicketRegistry {
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id(), kind = %ticket.kind()))]
    async fn add(&self, ticket: Ticket) -> TicketResult<()> {
        let now = self.clock.now();
        let id = ticket.id().clone();
        let mut map = self.tickets.write();

        if map.contains_key(&id) || self.tombstones.contains_key(&id) {
            tracing::error!("duplicate ticket identifier rejected");
            return Err(TicketError::duplicate(&id));
        }

        if let Some(parent_id) = ticket.parent().cloned() {
            let Some(parent) = map.get(&parent_id) else {
                return Err(TicketError::not_found(&parent_id));
            };
            if !parent.kind().can_parent(ticket.kind()) {
                return Err(TicketError::invalid_kind(
                    &parent_id,
                    parent.kind(),
                    ticket.kind().expected_parent(),
                ));
            }
            if expired_in(&map, parent, now) {
                return Err(TicketError::expired(&parent_id));
            }
            if let Some(parent) = map.get_mut(&parent_id) {
                parent.add_child(id.clone());
            }
        }

        map.insert(id, ticket);
        tracing::debug!("ticket added");
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn fetch(&self, id: &TicketId) -> TicketResult<Ticket> {
        let now = self.clock.now();
        {
            let map = self.tickets.read();
            match map.get(id) {
                None => return Err(TicketError::not_found(id)),
                Some(ticket) if !expired_in(&map, ticket, now) => return Ok(ticket.clone()),
                Some(_) => {},
            }
        }

        // Re-check under the write lock: an update may have refreshed it.
        let mut map = self.tickets.write();
        match map.get(id) {
            None => Err(TicketError::not_found(id)),
            Some(ticket) if !expired_in(&map, ticket, now) => Ok(ticket.clone()),
            Some(_) => {
                let removed = self.remove_subtree(&mut map, id);
                tracing::debug!(removed = removed.len(), "purged expired ticket");
                Err(TicketError::expired(id))
            },
        }
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn consume(&self, id: &TicketId, service: &str) -> TicketResult<Ticket> {
        let now = self.clock.now();
        let mut map = self.tickets.write();

        let Some(mut ticket) = map.remove(id) else {
            if self.tombstones.contains_key(id) {
                tracing::warn!("replay of consumed ticket");
                return Err(TicketError::already_consumed(id));
            }
            return Err(TicketError::not_found(id));
        };

        if expired_in(&map, &ticket, now) {
            map.insert(id.clone(), ticket);
            let removed = self.remove_subtree(&mut map, id);
            tracing::debug!(removed = removed.len(), "purged expired ticket");
            return Err(TicketError::expired(id));
        }

        let bound = match ticket.service_id() {
            Some(bound) if ticket.kind().is_one_time() => bound.to_owned(),
            _ => {
                let kind = ticket.kind();
                map.insert(id.clone(), ticket);
                return Err(TicketError::invalid_kind(id, kind, "service or proxy"));
            },
        };

        if bound != service {
            // Burned: the ticket stays removed.
            unlink(&mut map, &ticket);
            self.tombstones.insert(id.clone(), now);
            tracing::warn!(bound = %bound, presented = %service, "service mismatch, ticket burned");
            return Err(TicketError::service_mismatch(id, bound, service));
        }

        ticket.record_use(now);
        if ticket.is_used_up(now) {
            unlink(&mut map, &ticket);
            self.tombstones.insert(id.clone(), now);
            tracing::debug!("ticket consumed");
        } else {
            map.insert(id.clone(), ticket.clone());
            tracing::debug!(usage_count = ticket.usage_count(), "ticket used");
        }
        Ok(ticket)
    }

    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn update(&self, ticket: &Ticket) -> TicketResult<Ticket> {
        let mut map = self.tickets.write();
        let Some(stored) = map.get_mut(ticket.id()) else {
            return Err(TicketError::not_found(ticket.id()));
        };
        stored.merge_from(ticket);
        Ok(stored.clone())
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete(&self, id: &TicketId) -> TicketResult<bool> {
        let mut map = self.tickets.write();
        if let Some(ticket) = map.remove(id) {
            unlink(&mut map, &ticket);
            return Ok(true);
        }
        self.tombstones.invalidate(id);
        Ok(false)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete_with_children(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        let mut map = self.tickets.write();
        let removed = self.remove_subtree(&mut map, id);
        tracing::debug!(removed = removed.len(), "ticket subtree deleted");
        Ok(removed)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete_if_expired(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        let now = self.clock.now();
        let mut map = self.tickets.write();
        if !map.get(id).is_some_and(|ticket| expired_in(&map, ticket, now)) {
            return Ok(Vec::new());
        }
        let removed = self.remove_subtree(&mut map, id);
        tracing::debug!(removed = removed.len(), "purged expired ticket");
        Ok(removed)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn prune_children(&self, id: &TicketId) -> TicketResult<usize> {
        let mut guard = self.tickets.write();
        let map = &mut *guard;
        let Some(mut ticket) = map.remove(id) else {
            return Ok(0);
        };
        let pruned = ticket.retain_children(|child| !map.contains_key(child));
        map.insert(id.clone(), ticket);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale child links");
        }
        Ok(pruned)
    }

    async fn get_all(&self) -> TicketResult<Vec<Ticket>> {
        Ok(self.tickets.read().values().cloned().collect())
    }

    fn is_volatile(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        clock::ManualClock,
        expiration::ExpirationPolicy,
        ticket::{Authentication, TicketKind},
    };

    fn setup() -> (Arc<ManualClock>, MemoryTicketRegistry) {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = MemoryTicketRegistry::new(clock.clone());
        (clock, registry)
    }

    fn tgt(id: &str, now: DateTime<Utc>) -> Ticket {
        Ticket::ticket_granting(
            TicketId::new(id),
            Authentication::builder().principal("casuser").build(),
            Arc::new(ExpirationPolicy::ticket_granting(
                Duration::from_secs(600),
                Duration::from_secs(120),
            )),
            now,
        )
    }

    fn st(id: &str, parent: &str, now: DateTime<Utc>) -> Ticket {
        Ticket::service(
            TicketId::new(id),
            TicketId::new(parent),
            "https://app.example",
            false,
            Arc::new(ExpirationPolicy::multi_use(1, Duration::from_secs(10))),
            now,
        )
    }

    #[tokio::test]
    async fn test_add_links_child_to_parent() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();

        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        assert!(parent.child_tickets().unwrap().contains(&TicketId::new("ST-1")));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_consume_leaves_tombstone() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();

        let used = registry.consume(&TicketId::new("ST-1"), "https://app.example").await.unwrap();
        assert_eq!(used.usage_count(), 1);
        assert!(registry.is_consumed(&TicketId::new("ST-1")));
        assert_eq!(registry.len(), 1);

        // A consumed id can never be reused.
        let again = registry.add(st("ST-1", "TGT-1", clock.now())).await;
        assert!(matches!(again, Err(TicketError::DuplicateIdentifier { .. })));
    }

    #[tokio::test]
    async fn test_consume_rejects_granting_ticket_without_removing_it() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();

        let result = registry.consume(&TicketId::new("TGT-1"), "https://app.example").await;
        assert!(matches!(
            result,
            Err(TicketError::InvalidKind { actual: TicketKind::TicketGranting, .. })
        ));
        assert!(registry.get(&TicketId::new("TGT-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_parent_expires_child() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        let long_lived = Ticket::service(
            TicketId::new("ST-1"),
            TicketId::new("TGT-1"),
            "https://app.example",
            false,
            Arc::new(ExpirationPolicy::NeverExpires),
            clock.now(),
        );
        registry.add(long_lived).await.unwrap();

        clock.advance(Duration::from_secs(601));

        let result = registry.fetch(&TicketId::new("ST-1")).await;
        assert!(matches!(result, Err(TicketError::Expired { .. })));
        let result = registry.fetch(&TicketId::new("TGT-1")).await;
        assert!(matches!(result, Err(TicketError::Expired { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_update_cannot_resurrect() {
        let (clock, registry) = setup();
        let ticket = tgt("TGT-1", clock.now());
        registry.add(ticket.clone()).await.unwrap();
        assert!(registry.delete(ticket.id()).await.unwrap());

        let result = registry.update(&ticket).await;
        assert!(matches!(result, Err(TicketError::NotFound { .. })));
        assert!(!registry.delete(ticket.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_tombstone_capacity_is_bounded() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = RegistryConfig::builder().tombstone_capacity(10).build();
        let registry = MemoryTicketRegistry::with_config(&config, clock.clone()).unwrap();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();

        for i in 0..100 {
            let id = format!("ST-{i}");
            registry.add(st(&id, "TGT-1", clock.now())).await.unwrap();
            registry.consume(&TicketId::new(id), "https://app.example").await.unwrap();
        }

        registry.tombstones.run_pending_tasks();
        assert!(registry.tombstones.entry_count() <= 10);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let config = RegistryConfig::builder().tombstone_ttl(Duration::ZERO).build();
        let result = MemoryTicketRegistry::with_config(&config, clock.clone());
        assert!(matches!(result, Err(TicketError::Config { .. })));

        let registry = MemoryTicketRegistry::new(clock);
        assert!(registry.is_volatile());
    }

    #[tokio::test]
    async fn test_consumed_children_are_unlinked() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();

        for i in 0..50 {
            let id = format!("ST-{i}");
            registry.add(st(&id, "TGT-1", clock.now())).await.unwrap();
            registry.consume(&TicketId::new(id), "https://app.example").await.unwrap();
        }

        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        assert!(parent.child_tickets().unwrap().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_drops_only_missing_children() {
        let (clock, registry) = setup();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-2", "TGT-1", clock.now())).await.unwrap();

        // A stale link left behind by a removal that bypassed the parent.
        registry.tickets.write().remove(&TicketId::new("ST-1"));

        let pruned = registry.prune_children(&TicketId::new("TGT-1")).await.unwrap();
        assert_eq!(pruned, 1);
        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        let children: Vec<_> = parent.child_tickets().unwrap().iter().map(TicketId::as_str).collect();
        assert_eq!(children, vec!["ST-2"]);
    }
}
