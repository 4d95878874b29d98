//! Conformance test suite for [`TicketRegistry`] implementations.
//!
//! Async check functions validating the registry contract the ticket
//! service depends on. Each check takes a fresh registry and the
//! [`ManualClock`] that registry reads time from:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sso_tickets::{ManualClock, MemoryTicketRegistry, conformance};
//!
//! #[tokio::test]
//! async fn consume_is_one_time() {
//!     let clock = Arc::new(ManualClock::starting_now());
//!     let registry = MemoryTicketRegistry::new(clock.clone());
//!     conformance::consume_is_one_time(&registry, &clock).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Add | duplicates, parent validation, parent kind pairing, child linking |
//! | Read | expiry reporting and purging, ancestor-bound expiry |
//! | Consume | one-time use, service binding, kind checks, use limits |
//! | Update | stamp persistence, no resurrection |
//! | Delete | single delete, cascading delete, conditional expiry delete, child unlinking |
//! | Concurrent | exactly-one-winner consume, no lost children |

use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;

use crate::{
    assert_ticket_err,
    clock::{Clock, ManualClock},
    expiration::ExpirationPolicy,
    registry::TicketRegistry,
    testutil::{APP, GRANTING_IDLE_TIMEOUT, GRANTING_MAX_LIFETIME, ONE_TIME_TTL, pgt, pt, st, tgt},
    ticket::{Ticket, TicketId},
};

/// Number of tasks racing in the concurrent checks.
const CONTENDERS: usize = 8;

fn ids(tickets: &[Ticket]) -> Vec<&str> {
    tickets.iter().map(|ticket| ticket.id().as_str()).collect()
}

fn ids_of<'a>(set: impl IntoIterator<Item = &'a TicketId>) -> Vec<&'a str> {
    set.into_iter().map(TicketId::as_str).collect()
}

// ============================================================================
// Add
// ============================================================================

/// `add` then `get` returns the same ticket.
pub async fn add_then_get_round_trips<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    let ticket = tgt("TGT-1", clock.now());
    registry.add(ticket.clone()).await.expect("add");

    let stored = registry.get(ticket.id()).await.expect("get");
    assert_eq!(stored, ticket);
}

/// An existing id is never overwritten.
pub async fn add_rejects_duplicate_id<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add");

    clock.advance(Duration::from_secs(1));
    let result = registry.add(tgt("TGT-1", clock.now())).await;
    assert_ticket_err!(result, DuplicateIdentifier);

    let stored = registry.get(&TicketId::new("TGT-1")).await.expect("original should remain");
    assert_eq!(stored.created_at(), clock.now() - chrono::TimeDelta::seconds(1));
}

/// A child whose parent does not exist is rejected and not stored.
pub async fn add_rejects_missing_parent<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    let result = registry.add(st("ST-1", "TGT-404", APP, clock.now())).await;
    match result {
        Err(crate::TicketError::NotFound { id }) => assert_eq!(id.as_str(), "TGT-404"),
        other => panic!("expected NotFound naming the parent, got {other:?}"),
    }
    let result = registry.get(&TicketId::new("ST-1")).await;
    assert_ticket_err!(result, NotFound);
}

/// A child whose parent has expired is rejected and not stored.
pub async fn add_rejects_expired_parent<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    clock.advance(GRANTING_MAX_LIFETIME + Duration::from_secs(1));

    let result = registry.add(st("ST-1", "TGT-1", APP, clock.now())).await;
    assert_ticket_err!(result, Expired);
    let result = registry.get(&TicketId::new("ST-1")).await;
    assert_ticket_err!(result, NotFound);
}

/// One-time tickets cannot own children.
pub async fn add_rejects_one_time_parent<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");

    let result = registry.add(st("ST-2", "ST-1", APP, clock.now())).await;
    assert_ticket_err!(result, InvalidKind);
}

/// STs hang off TGTs, PTs off PGTs, and PGTs off either.
pub async fn add_enforces_parent_kind<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    let now = clock.now();
    registry.add(tgt("TGT-1", now)).await.expect("add tgt");
    registry.add(pgt("PGT-2", "TGT-1", "ST-0", APP, now)).await.expect("pgt under tgt");
    registry.add(pgt("PGT-3", "PGT-2", "PT-0", APP, now)).await.expect("pgt under pgt");
    registry.add(pt("PT-4", "PGT-3", APP, now)).await.expect("pt under pgt");

    let result = registry.add(pt("PT-5", "TGT-1", APP, now)).await;
    assert_ticket_err!(result, InvalidKind, "pt under tgt");
    let result = registry.add(st("ST-6", "PGT-2", APP, now)).await;
    assert_ticket_err!(result, InvalidKind, "st under pgt");

    for id in ["PT-5", "ST-6"] {
        let result = registry.get(&TicketId::new(id)).await;
        assert_ticket_err!(result, NotFound, id);
    }
    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    assert_eq!(ids_of(parent.child_tickets().expect("children")), vec!["PGT-2"]);
}

/// Adding a child records it in the parent's child set.
pub async fn add_links_child_to_parent<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");
    registry.add(pgt("PGT-2", "TGT-1", "ST-1", APP, clock.now())).await.expect("add pgt");
    registry.add(pt("PT-3", "PGT-2", APP, clock.now())).await.expect("add pt");

    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    let children = parent.child_tickets().expect("tgt has children");
    assert!(children.contains(&TicketId::new("ST-1")));
    assert!(children.contains(&TicketId::new("PGT-2")));

    let proxy = registry.get(&TicketId::new("PGT-2")).await.expect("get pgt");
    assert!(proxy.child_tickets().expect("pgt has children").contains(&TicketId::new("PT-3")));
}

// ============================================================================
// Read
// ============================================================================

/// A ticket exactly at its limit is valid; one instant later it is gone.
pub async fn get_honours_strict_expiry_boundary<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let ticket = Ticket::ticket_granting(
        TicketId::new("TGT-1"),
        crate::testutil::authentication("casuser"),
        Arc::new(ExpirationPolicy::hard_timeout(Duration::from_secs(60))),
        clock.now(),
    );
    registry.add(ticket).await.expect("add");

    clock.advance(Duration::from_secs(60));
    registry.get(&TicketId::new("TGT-1")).await.expect("valid at the exact limit");

    clock.advance(Duration::from_millis(1));
    let result = registry.get(&TicketId::new("TGT-1")).await;
    assert_ticket_err!(result, NotFound);
}

/// `fetch` reports an expired ticket once, then it is purged.
pub async fn fetch_reports_then_purges_expired<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add");
    clock.advance(GRANTING_MAX_LIFETIME + Duration::from_secs(60));

    let result = registry.fetch(&TicketId::new("TGT-1")).await;
    assert_ticket_err!(result, Expired);
    let result = registry.fetch(&TicketId::new("TGT-1")).await;
    assert_ticket_err!(result, NotFound);
    assert!(registry.get_all().await.expect("get_all").is_empty());
}

/// A child never outlives its ancestor, even if its own policy is valid.
pub async fn expired_ancestor_expires_descendants<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(pgt("PGT-2", "TGT-1", "ST-0", APP, clock.now())).await.expect("add pgt");
    let long_lived = Ticket::proxy(
        TicketId::new("PT-3"),
        TicketId::new("PGT-2"),
        APP,
        Arc::new(ExpirationPolicy::NeverExpires),
        clock.now(),
    );
    registry.add(long_lived).await.expect("add pt");

    // Keep the PGT fresh while the TGT idles out.
    for _ in 0..5 {
        clock.advance(Duration::from_secs(60));
        let mut proxy = registry.get(&TicketId::new("PGT-2")).await.expect("pgt still valid");
        proxy.record_use(clock.now());
        registry.update(&proxy).await.expect("update pgt");
    }
    clock.advance(Duration::from_secs(1));

    let result = registry.get(&TicketId::new("PT-3")).await;
    assert_ticket_err!(result, NotFound, "PT under an expired TGT");
    let result = registry.consume(&TicketId::new("PT-3"), APP).await;
    assert!(result.is_err(), "PT under an expired TGT must not be consumable");
}

// ============================================================================
// Consume
// ============================================================================

/// An ST is consumed exactly once.
pub async fn consume_is_one_time<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");

    let used = registry.consume(&TicketId::new("ST-1"), APP).await.expect("first consume");
    assert_eq!(used.usage_count(), 1);
    assert_eq!(used.last_used_at(), clock.now());

    let replay = registry.consume(&TicketId::new("ST-1"), APP).await;
    assert_ticket_err!(replay, AlreadyConsumed);
    let read = registry.get(&TicketId::new("ST-1")).await;
    assert_ticket_err!(read, NotFound, "consumed tickets are invisible to get");
}

/// A ticket whose policy sets no use limit is still used only once.
pub async fn consume_is_one_time_without_use_limit<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let now = clock.now();
    registry.add(tgt("TGT-1", now)).await.expect("add tgt");
    registry.add(pgt("PGT-2", "TGT-1", "ST-0", APP, now)).await.expect("add pgt");
    let timed = Ticket::service(
        TicketId::new("ST-3"),
        TicketId::new("TGT-1"),
        APP,
        false,
        Arc::new(ExpirationPolicy::hard_timeout(ONE_TIME_TTL)),
        now,
    );
    let unbounded = Ticket::proxy(
        TicketId::new("PT-4"),
        TicketId::new("PGT-2"),
        APP,
        Arc::new(ExpirationPolicy::NeverExpires),
        now,
    );
    registry.add(timed).await.expect("add st");
    registry.add(unbounded).await.expect("add pt");

    for id in ["ST-3", "PT-4"] {
        let used = registry.consume(&TicketId::new(id), APP).await.expect("first consume");
        assert_eq!(used.usage_count(), 1);
        let replay = registry.consume(&TicketId::new(id), APP).await;
        assert_ticket_err!(replay, AlreadyConsumed, id);
    }
}

/// A mismatched service fails and burns the ticket.
pub async fn consume_mismatch_burns_ticket<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", "https://a.example", clock.now())).await.expect("add st");

    let result = registry.consume(&TicketId::new("ST-1"), "https://b.example").await;
    match result {
        Err(crate::TicketError::ServiceMismatch { expected, presented, .. }) => {
            assert_eq!(expected, "https://a.example");
            assert_eq!(presented, "https://b.example");
        },
        other => panic!("expected ServiceMismatch, got {other:?}"),
    }

    let retry = registry.consume(&TicketId::new("ST-1"), "https://a.example").await;
    assert_ticket_err!(retry, AlreadyConsumed);
}

/// Granting tickets cannot be consumed and are left untouched.
pub async fn consume_rejects_granting_ticket<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");

    let result = registry.consume(&TicketId::new("TGT-1"), APP).await;
    assert_ticket_err!(result, InvalidKind);
    let stored = registry.get(&TicketId::new("TGT-1")).await.expect("tgt remains");
    assert_eq!(stored.usage_count(), 0);
}

/// Unknown and timed-out tickets are reported as such.
pub async fn consume_reports_missing_and_expired<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let missing = registry.consume(&TicketId::new("ST-404"), APP).await;
    assert_ticket_err!(missing, NotFound);

    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");
    clock.advance(ONE_TIME_TTL + Duration::from_secs(1));

    let expired = registry.consume(&TicketId::new("ST-1"), APP).await;
    assert_ticket_err!(expired, Expired);
    let again = registry.consume(&TicketId::new("ST-1"), APP).await;
    assert_ticket_err!(again, NotFound, "expired tickets are purged, not tombstoned");
}

/// A ticket allowing `n` uses is consumable exactly `n` times.
pub async fn consume_honours_use_limit<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    let ticket = Ticket::service(
        TicketId::new("ST-1"),
        TicketId::new("TGT-1"),
        APP,
        false,
        Arc::new(ExpirationPolicy::multi_use(3, ONE_TIME_TTL)),
        clock.now(),
    );
    registry.add(ticket).await.expect("add st");

    for expected in 1..=3 {
        let used = registry.consume(&TicketId::new("ST-1"), APP).await.expect("consume within limit");
        assert_eq!(used.usage_count(), expected);
    }
    let result = registry.consume(&TicketId::new("ST-1"), APP).await;
    assert_ticket_err!(result, AlreadyConsumed);
}

// ============================================================================
// Update
// ============================================================================

/// `update` persists stamps and service records without losing children.
pub async fn update_persists_usage<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    let mut stale = registry.get(&TicketId::new("TGT-1")).await.expect("get");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");

    clock.advance(Duration::from_secs(30));
    stale.record_use(clock.now());
    stale.record_service(APP, TicketId::new("ST-1"), clock.now());
    let stored = registry.update(&stale).await.expect("update");

    assert_eq!(stored.usage_count(), 1);
    assert_eq!(stored.last_used_at(), clock.now());
    assert!(stored.granting().expect("granting").services.contains_key(APP));
    assert!(stored.child_tickets().expect("children").contains(&TicketId::new("ST-1")));
    assert_eq!(registry.get(&TicketId::new("TGT-1")).await.expect("get"), stored);
}

/// `update` never brings back a deleted or consumed ticket.
pub async fn update_never_resurrects<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    let granting = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");
    let service = registry.get(&TicketId::new("ST-1")).await.expect("get st");

    registry.consume(&TicketId::new("ST-1"), APP).await.expect("consume");
    let result = registry.update(&service).await;
    assert_ticket_err!(result, NotFound, "update of a consumed ticket");

    assert!(registry.delete(&TicketId::new("TGT-1")).await.expect("delete"));
    let result = registry.update(&granting).await;
    assert_ticket_err!(result, NotFound, "update of a deleted ticket");
}

// ============================================================================
// Delete
// ============================================================================

/// `delete` removes one ticket and reports whether it existed.
pub async fn delete_removes_single_ticket<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");

    assert!(registry.delete(&TicketId::new("ST-1")).await.expect("delete st"));
    assert!(!registry.delete(&TicketId::new("ST-1")).await.expect("delete again"));
    registry.get(&TicketId::new("TGT-1")).await.expect("parent untouched");
}

/// `delete_with_children` removes the whole subtree, root first, and
/// leaves consumed tickets out of the result.
pub async fn delete_with_children_removes_subtree<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let now = clock.now();
    registry.add(tgt("TGT-1", now)).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, now)).await.expect("add st-1");
    registry.add(st("ST-2", "TGT-1", APP, now)).await.expect("add st-2");
    registry.consume(&TicketId::new("ST-2"), APP).await.expect("consume st-2");
    registry.add(pgt("PGT-3", "TGT-1", "ST-2", APP, now)).await.expect("add pgt");
    registry.add(pt("PT-4", "PGT-3", "https://backend.example", now)).await.expect("add pt");
    registry.add(tgt("TGT-9", now)).await.expect("add unrelated tgt");

    let removed = registry.delete_with_children(&TicketId::new("TGT-1")).await.expect("cascade");
    let removed = ids(&removed);
    assert_eq!(removed.len(), 4, "removed: {removed:?}");
    assert_eq!(removed[0], "TGT-1");
    for id in ["ST-1", "PGT-3", "PT-4"] {
        assert!(removed.contains(&id), "{id} missing from {removed:?}");
    }

    for id in ["TGT-1", "ST-1", "ST-2", "PGT-3", "PT-4"] {
        let result = registry.get(&TicketId::new(id)).await;
        assert_ticket_err!(result, NotFound, id);
    }
    registry.get(&TicketId::new("TGT-9")).await.expect("unrelated session survives");
}

/// Consumed, burned and deleted tickets leave their parent's child set.
pub async fn removal_unlinks_child_from_parent<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let now = clock.now();
    registry.add(tgt("TGT-1", now)).await.expect("add tgt");
    for id in ["ST-1", "ST-2", "ST-3"] {
        registry.add(st(id, "TGT-1", APP, now)).await.expect("add st");
    }
    registry.add(pgt("PGT-4", "TGT-1", "ST-0", APP, now)).await.expect("add pgt");
    registry.add(st("ST-5", "TGT-1", APP, now)).await.expect("add st-5");

    registry.consume(&TicketId::new("ST-1"), APP).await.expect("consume");
    let burned = registry.consume(&TicketId::new("ST-2"), "https://other.example").await;
    assert_ticket_err!(burned, ServiceMismatch);
    assert!(registry.delete(&TicketId::new("ST-3")).await.expect("delete"));
    registry.delete_with_children(&TicketId::new("PGT-4")).await.expect("cascade");

    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    assert_eq!(ids_of(parent.child_tickets().expect("children")), vec!["ST-5"]);
}

/// Pruning keeps every link to a live child.
pub async fn prune_children_keeps_live_links<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st-1");
    registry.add(st("ST-2", "TGT-1", APP, clock.now())).await.expect("add st-2");

    assert_eq!(registry.prune_children(&TicketId::new("TGT-1")).await.expect("prune"), 0);
    assert_eq!(registry.prune_children(&TicketId::new("TGT-404")).await.expect("prune missing"), 0);
    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    assert_eq!(ids_of(parent.child_tickets().expect("children")), vec!["ST-1", "ST-2"]);
}

/// `delete_if_expired` removes a subtree only while its root is expired,
/// whether by its own policy or through an ancestor.
pub async fn delete_if_expired_spares_valid_tickets<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    let now = clock.now();
    registry.add(tgt("TGT-1", now)).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, now)).await.expect("add st");
    let long_lived = Ticket::service(
        TicketId::new("ST-2"),
        TicketId::new("TGT-1"),
        APP,
        false,
        Arc::new(ExpirationPolicy::NeverExpires),
        now,
    );
    registry.add(long_lived).await.expect("add long-lived st");

    let removed = registry.delete_if_expired(&TicketId::new("TGT-1")).await.expect("valid root");
    assert!(removed.is_empty());
    let removed = registry.delete_if_expired(&TicketId::new("TGT-404")).await.expect("missing root");
    assert!(removed.is_empty());

    clock.advance(ONE_TIME_TTL + Duration::from_secs(1));
    let removed = registry.delete_if_expired(&TicketId::new("ST-1")).await.expect("expired st");
    assert_eq!(ids(&removed), vec!["ST-1"]);
    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("tgt still valid");
    assert_eq!(ids_of(parent.child_tickets().expect("children")), vec!["ST-2"]);

    clock.advance(GRANTING_IDLE_TIMEOUT);
    let removed = registry.delete_if_expired(&TicketId::new("ST-2")).await.expect("expired ancestor");
    assert_eq!(ids(&removed), vec!["ST-2"]);
    let removed = registry.delete_if_expired(&TicketId::new("TGT-1")).await.expect("expired tgt");
    assert_eq!(ids(&removed), vec!["TGT-1"]);
    assert!(registry.get_all().await.expect("get_all").is_empty());
}

/// Cascading from an unknown id removes nothing.
pub async fn delete_with_children_missing_root_is_empty<R: TicketRegistry>(
    registry: &R,
    _clock: &ManualClock,
) {
    let removed = registry.delete_with_children(&TicketId::new("TGT-404")).await.expect("cascade");
    assert!(removed.is_empty());
}

/// `get_all` lists live tickets, expired ones included, but no tombstones.
pub async fn get_all_lists_live_tickets<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st-1");
    registry.add(st("ST-2", "TGT-1", APP, clock.now())).await.expect("add st-2");
    registry.consume(&TicketId::new("ST-2"), APP).await.expect("consume");
    clock.advance(ONE_TIME_TTL + Duration::from_secs(1));

    let mut all = registry.get_all().await.expect("get_all");
    all.sort_by(|a, b| a.id().cmp(b.id()));
    assert_eq!(ids(&all), vec!["ST-1", "TGT-1"]);
}

// ============================================================================
// Concurrent
// ============================================================================

/// Of many concurrent consumers exactly one wins; the rest see
/// `AlreadyConsumed`.
pub async fn concurrent_consume_has_single_winner<R>(registry: Arc<R>, clock: &ManualClock)
where
    R: TicketRegistry + 'static,
{
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");
    registry.add(st("ST-1", "TGT-1", APP, clock.now())).await.expect("add st");

    let mut tasks = JoinSet::new();
    for _ in 0..CONTENDERS {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move { registry.consume(&TicketId::new("ST-1"), APP).await });
    }

    let mut winners = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("task panicked") {
            Ok(_) => winners += 1,
            Err(crate::TicketError::AlreadyConsumed { .. }) => {},
            Err(other) => panic!("unexpected consume error: {other:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one consumer must win");
}

/// Children added concurrently under one parent are all linked.
pub async fn concurrent_adds_link_every_child<R>(registry: Arc<R>, clock: &ManualClock)
where
    R: TicketRegistry + 'static,
{
    registry.add(tgt("TGT-1", clock.now())).await.expect("add tgt");

    let mut tasks = JoinSet::new();
    for i in 0..CONTENDERS {
        let registry = Arc::clone(&registry);
        let ticket = st(&format!("ST-{i}"), "TGT-1", APP, clock.now());
        tasks.spawn(async move { registry.add(ticket).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task panicked").expect("concurrent add");
    }

    let parent = registry.get(&TicketId::new("TGT-1")).await.expect("get tgt");
    assert_eq!(parent.child_tickets().expect("children").len(), CONTENDERS);

    let removed = registry.delete_with_children(&TicketId::new("TGT-1")).await.expect("cascade");
    assert_eq!(removed.len(), CONTENDERS + 1);
}

/// Runs every check, each against a fresh registry from `factory`.
pub async fn run_all<R, F>(factory: F)
where
    R: TicketRegistry + 'static,
    F: Fn(Arc<ManualClock>) -> R,
{
    macro_rules! check {
        ($check:ident) => {{
            let clock = Arc::new(ManualClock::starting_now());
            let registry = factory(clock.clone());
            $check(&registry, &clock).await;
        }};
    }

    check!(add_then_get_round_trips);
    check!(add_rejects_duplicate_id);
    check!(add_rejects_missing_parent);
    check!(add_rejects_expired_parent);
    check!(add_rejects_one_time_parent);
    check!(add_enforces_parent_kind);
    check!(add_links_child_to_parent);
    check!(get_honours_strict_expiry_boundary);
    check!(fetch_reports_then_purges_expired);
    check!(expired_ancestor_expires_descendants);
    check!(consume_is_one_time);
    check!(consume_is_one_time_without_use_limit);
    check!(consume_mismatch_burns_ticket);
    check!(consume_rejects_granting_ticket);
    check!(consume_reports_missing_and_expired);
    check!(consume_honours_use_limit);
    check!(update_persists_usage);
    check!(update_never_resurrects);
    check!(delete_removes_single_ticket);
    check!(delete_with_children_removes_subtree);
    check!(delete_with_children_missing_root_is_empty);
    check!(removal_unlinks_child_from_parent);
    check!(prune_children_keeps_live_links);
    check!(delete_if_expired_spares_valid_tickets);
    check!(get_all_lists_live_tickets);

    let clock = Arc::new(ManualClock::starting_now());
    concurrent_consume_has_single_winner(Arc::new(factory(clock.clone())), &clock).await;
    let clock = Arc::new(ManualClock::starting_now());
    concurrent_adds_link_every_child(Arc::new(factory(clock.clone())), &clock).await;
}
