//! Ticket data model.
//!
//! A [`Ticket`] carries the lifecycle fields every kind shares (id, stamps,
//! usage counter, expiration policy) and a [`TicketBody`] holding the
//! kind-specific relations:
//!
//! | Kind | Body | Parent | One-time |
//! |------|------|--------|----------|
//! | TGT | [`GrantingData`] | none | no |
//! | ST | [`ServiceData`] | TGT | yes |
//! | PGT | [`GrantingData`] | TGT or PGT | no |
//! | PT | [`ServiceData`] | PGT | yes |
//!
//! Parents own the set of their children's ids; children only hold their
//! parent's id. Tickets are mutated through a
//! [`TicketRegistry`](crate::TicketRegistry), never in place by callers
//! holding a shared copy.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expiration::{ExpirationPolicy, UsageStamps};

/// Opaque, globally unique ticket identifier.
///
/// Formatted as `<kind-prefix>-<sequence>-<random>[-<suffix>]`. Callers
/// never parse ids beyond passing them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind named by the id's prefix, if it carries a known one.
    #[must_use]
    pub fn kind(&self) -> Option<TicketKind> {
        let prefix = self.0.split('-').next()?;
        TicketKind::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TicketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The four ticket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Root of an SSO session.
    TicketGranting,
    /// One-time ticket minted from a TGT for one service.
    Service,
    /// TGT-like ticket held by a proxying service.
    ProxyGranting,
    /// One-time ticket minted from a PGT.
    Proxy,
}

impl TicketKind {
    /// Every kind, in hierarchy order.
    pub const ALL: [Self; 4] = [Self::TicketGranting, Self::Service, Self::ProxyGranting, Self::Proxy];

    /// The id prefix for this kind.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => "TGT",
            Self::Service => "ST",
            Self::ProxyGranting => "PGT",
            Self::Proxy => "PT",
        }
    }

    /// TGTs and PGTs can have children.
    #[must_use]
    pub fn is_granting(self) -> bool {
        matches!(self, Self::TicketGranting | Self::ProxyGranting)
    }

    /// STs and PTs are consumed on validation.
    #[must_use]
    pub fn is_one_time(self) -> bool {
        !self.is_granting()
    }

    /// The kinds a ticket of this kind may be issued under, for messages.
    #[must_use]
    pub fn expected_parent(self) -> &'static str {
        match self {
            Self::TicketGranting => "no parent",
            Self::Service => "ticket-granting",
            Self::ProxyGranting => "ticket-granting or proxy-granting",
            Self::Proxy => "proxy-granting",
        }
    }

    /// Whether a ticket of this kind may own a child of kind `child`.
    ///
    /// STs hang off TGTs, PTs off PGTs, and PGTs off either granting kind.
    #[must_use]
    pub fn can_parent(self, child: Self) -> bool {
        matches!(
            (self, child),
            (Self::TicketGranting, Self::Service | Self::ProxyGranting)
                | (Self::ProxyGranting, Self::Proxy | Self::ProxyGranting)
        )
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TicketGranting => write!(f, "ticket-granting"),
            Self::Service => write!(f, "service"),
            Self::ProxyGranting => write!(f, "proxy-granting"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// Lifecycle state of a ticket.
///
/// Derived on demand, never stored: the policy is always re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketState {
    /// Usable.
    Valid,
    /// A one-time ticket that has been used up.
    Consumed,
    /// Ended by its expiration policy.
    Expired,
    /// Ended by explicit or cascading revocation.
    Revoked,
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Consumed => write!(f, "consumed"),
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

/// Principal and attributes established by primary authentication.
///
/// Opaque to registries; never written to logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Authentication {
    /// Authenticated principal identifier.
    #[builder(into)]
    pub principal: String,
    /// Released principal attributes.
    #[builder(default)]
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    /// When primary authentication happened.
    #[builder(default = Utc::now())]
    pub authenticated_at: DateTime<Utc>,
    /// Whether the user asked for a long-term session.
    #[builder(default)]
    #[serde(default)]
    pub remember_me: bool,
}

/// Access record for a service that received a ticket from a granting ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccess {
    /// The one-time ticket the service received.
    pub ticket_id: TicketId,
    /// When it was granted.
    pub granted_at: DateTime<Utc>,
}

/// Relations of TGTs and PGTs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantingData {
    /// The session's authentication. PGTs carry a copy of their root's.
    pub authentication: Authentication,
    /// Services that received tickets, keyed by service identifier.
    pub services: BTreeMap<String, ServiceAccess>,
    /// Ids of every ticket issued directly against this one.
    pub child_tickets: BTreeSet<TicketId>,
    /// Granting ticket above this one; `None` for a TGT.
    pub parent: Option<TicketId>,
    /// The ST or PT whose validation produced this PGT.
    pub proxied_by: Option<TicketId>,
    /// The service holding this PGT.
    pub proxy_service: Option<String>,
}

/// Relations of STs and PTs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    /// Owning TGT or PGT.
    pub parent: TicketId,
    /// The service this ticket is bound to.
    pub service: String,
    /// Issued from fresh primary credentials rather than an existing session.
    pub credential_provided: bool,
}

/// Kind-specific part of a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketBody {
    /// A TGT.
    TicketGranting(GrantingData),
    /// An ST.
    Service(ServiceData),
    /// A PGT.
    ProxyGranting(GrantingData),
    /// A PT.
    Proxy(ServiceData),
}

/// A ticket of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    id: TicketId,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    previous_used_at: Option<DateTime<Utc>>,
    usage_count: u32,
    expiration_policy: Arc<ExpirationPolicy>,
    body: TicketBody,
}

impl Ticket {
    fn with_body(
        id: TicketId,
        expiration_policy: Arc<ExpirationPolicy>,
        now: DateTime<Utc>,
        body: TicketBody,
    ) -> Self {
        Self {
            id,
            created_at: now,
            last_used_at: now,
            previous_used_at: None,
            usage_count: 0,
            expiration_policy,
            body,
        }
    }

    /// Creates a TGT for a freshly authenticated session.
    #[must_use]
    pub fn ticket_granting(
        id: TicketId,
        authentication: Authentication,
        expiration_policy: Arc<ExpirationPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_body(
            id,
            expiration_policy,
            now,
            TicketBody::TicketGranting(GrantingData {
                authentication,
                services: BTreeMap::new(),
                child_tickets: BTreeSet::new(),
                parent: None,
                proxied_by: None,
                proxy_service: None,
            }),
        )
    }

    /// Creates an ST owned by `parent`.
    #[must_use]
    pub fn service(
        id: TicketId,
        parent: TicketId,
        service: impl Into<String>,
        credential_provided: bool,
        expiration_policy: Arc<ExpirationPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_body(
            id,
            expiration_policy,
            now,
            TicketBody::Service(ServiceData { parent, service: service.into(), credential_provided }),
        )
    }

    /// Creates a PGT for `proxy_service`, produced by validating `proxied_by`.
    #[must_use]
    pub fn proxy_granting(
        id: TicketId,
        parent: TicketId,
        authentication: Authentication,
        proxied_by: TicketId,
        proxy_service: impl Into<String>,
        expiration_policy: Arc<ExpirationPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_body(
            id,
            expiration_policy,
            now,
            TicketBody::ProxyGranting(GrantingData {
                authentication,
                services: BTreeMap::new(),
                child_tickets: BTreeSet::new(),
                parent: Some(parent),
                proxied_by: Some(proxied_by),
                proxy_service: Some(proxy_service.into()),
            }),
        )
    }

    /// Creates a PT owned by the PGT `parent`.
    #[must_use]
    pub fn proxy(
        id: TicketId,
        parent: TicketId,
        service: impl Into<String>,
        expiration_policy: Arc<ExpirationPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_body(
            id,
            expiration_policy,
            now,
            TicketBody::Proxy(ServiceData {
                parent,
                service: service.into(),
                credential_provided: false,
            }),
        )
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &TicketId {
        &self.id
    }

    /// The ticket kind.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        match self.body {
            TicketBody::TicketGranting(_) => TicketKind::TicketGranting,
            TicketBody::Service(_) => TicketKind::Service,
            TicketBody::ProxyGranting(_) => TicketKind::ProxyGranting,
            TicketBody::Proxy(_) => TicketKind::Proxy,
        }
    }

    /// Kind-specific relations.
    #[must_use]
    pub fn body(&self) -> &TicketBody {
        &self.body
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last use; the creation time before the first.
    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Time of the use before the last one.
    #[must_use]
    pub fn previous_used_at(&self) -> Option<DateTime<Utc>> {
        self.previous_used_at
    }

    /// Number of recorded uses.
    #[must_use]
    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    /// The shared expiration policy.
    #[must_use]
    pub fn expiration_policy(&self) -> &Arc<ExpirationPolicy> {
        &self.expiration_policy
    }

    /// What the expiration policy evaluates.
    #[must_use]
    pub fn stamps(&self) -> UsageStamps {
        UsageStamps {
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
        }
    }

    /// Whether this ticket's own policy reports it expired at `now`.
    ///
    /// Registries additionally treat a ticket as expired when any ancestor
    /// is missing or expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_policy.is_expired(&self.stamps(), now)
    }

    /// Derived lifecycle state at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> TicketState {
        if !self.is_expired(now) {
            TicketState::Valid
        } else if self.kind().is_one_time() && self.usage_count > 0 {
            TicketState::Consumed
        } else {
            TicketState::Expired
        }
    }

    /// The owning ticket, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&TicketId> {
        match &self.body {
            TicketBody::TicketGranting(data) | TicketBody::ProxyGranting(data) => data.parent.as_ref(),
            TicketBody::Service(data) | TicketBody::Proxy(data) => Some(&data.parent),
        }
    }

    /// Granting relations, for TGTs and PGTs.
    #[must_use]
    pub fn granting(&self) -> Option<&GrantingData> {
        match &self.body {
            TicketBody::TicketGranting(data) | TicketBody::ProxyGranting(data) => Some(data),
            TicketBody::Service(_) | TicketBody::Proxy(_) => None,
        }
    }

    fn granting_mut(&mut self) -> Option<&mut GrantingData> {
        match &mut self.body {
            TicketBody::TicketGranting(data) | TicketBody::ProxyGranting(data) => Some(data),
            TicketBody::Service(_) | TicketBody::Proxy(_) => None,
        }
    }

    /// Service relations, for STs and PTs.
    #[must_use]
    pub fn service_data(&self) -> Option<&ServiceData> {
        match &self.body {
            TicketBody::Service(data) | TicketBody::Proxy(data) => Some(data),
            TicketBody::TicketGranting(_) | TicketBody::ProxyGranting(_) => None,
        }
    }

    /// The service an ST or PT is bound to.
    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        self.service_data().map(|data| data.service.as_str())
    }

    /// The authentication held by a TGT or PGT.
    #[must_use]
    pub fn authentication(&self) -> Option<&Authentication> {
        self.granting().map(|data| &data.authentication)
    }

    /// Ids of the tickets issued directly against a TGT or PGT.
    #[must_use]
    pub fn child_tickets(&self) -> Option<&BTreeSet<TicketId>> {
        self.granting().map(|data| &data.child_tickets)
    }

    /// Whether a used one-time ticket must be retired.
    ///
    /// True once the policy expires it. A policy without a use limit still
    /// grants a single use.
    #[must_use]
    pub fn is_used_up(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now)
            || (self.kind().is_one_time()
                && self.usage_count > 0
                && !self.expiration_policy.limits_uses())
    }

    /// Stamps a use.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.previous_used_at = Some(self.last_used_at);
        self.last_used_at = now;
        self.usage_count = self.usage_count.saturating_add(1);
    }

    /// Records that `service` received `ticket_id` from this granting ticket.
    ///
    /// Returns `false` for STs and PTs, which have no service map.
    pub fn record_service(
        &mut self,
        service: impl Into<String>,
        ticket_id: TicketId,
        now: DateTime<Utc>,
    ) -> bool {
        match self.granting_mut() {
            Some(data) => {
                data.services.insert(service.into(), ServiceAccess { ticket_id, granted_at: now });
                true
            },
            None => false,
        }
    }

    /// Registers a child id. Returns `false` for STs and PTs.
    pub(crate) fn add_child(&mut self, child: TicketId) -> bool {
        match self.granting_mut() {
            Some(data) => {
                data.child_tickets.insert(child);
                true
            },
            None => false,
        }
    }

    /// Drops a child id. Returns whether it was linked.
    pub(crate) fn remove_child(&mut self, child: &TicketId) -> bool {
        self.granting_mut().is_some_and(|data| data.child_tickets.remove(child))
    }

    /// Drops every child id `is_gone` reports. Returns how many were dropped.
    pub(crate) fn retain_children(&mut self, mut is_gone: impl FnMut(&TicketId) -> bool) -> usize {
        let Some(data) = self.granting_mut() else {
            return 0;
        };
        let before = data.child_tickets.len();
        data.child_tickets.retain(|child| !is_gone(child));
        before - data.child_tickets.len()
    }

    /// Applies the mutable fields of `incoming` onto this stored ticket.
    ///
    /// Usage stamps only move forward, service maps are merged, and the
    /// registry-owned child set is left untouched.
    pub(crate) fn merge_from(&mut self, incoming: &Ticket) {
        if incoming.last_used_at > self.last_used_at {
            self.previous_used_at = incoming.previous_used_at.or(Some(self.last_used_at));
            self.last_used_at = incoming.last_used_at;
        }
        self.usage_count = self.usage_count.max(incoming.usage_count);

        if let (Some(stored), Some(incoming)) = (self.granting_mut(), incoming.granting()) {
            for (service, access) in &incoming.services {
                stored.services.insert(service.clone(), access.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    fn auth() -> Authentication {
        Authentication::builder().principal("casuser").build()
    }

    fn tgt(now: DateTime<Utc>) -> Ticket {
        Ticket::ticket_granting(
            TicketId::new("TGT-1-aaaa"),
            auth(),
            Arc::new(ExpirationPolicy::ticket_granting(
                Duration::from_secs(600),
                Duration::from_secs(60),
            )),
            now,
        )
    }

    #[test]
    fn test_id_kind_from_prefix() {
        assert_eq!(TicketId::new("TGT-1-ab").kind(), Some(TicketKind::TicketGranting));
        assert_eq!(TicketId::new("ST-9-ab-node1").kind(), Some(TicketKind::Service));
        assert_eq!(TicketId::new("PGT-2-ab").kind(), Some(TicketKind::ProxyGranting));
        assert_eq!(TicketId::new("PT-3-ab").kind(), Some(TicketKind::Proxy));
        assert_eq!(TicketId::new("XX-3-ab").kind(), None);
    }

    #[test]
    fn test_kind_classification() {
        for kind in TicketKind::ALL {
            assert_ne!(kind.is_granting(), kind.is_one_time());
        }
        assert!(TicketKind::ProxyGranting.is_granting());
        assert!(TicketKind::Proxy.is_one_time());
    }

    #[test]
    fn test_parent_pairing() {
        use TicketKind::{Proxy, ProxyGranting, Service, TicketGranting};

        let allowed = [
            (TicketGranting, Service),
            (TicketGranting, ProxyGranting),
            (ProxyGranting, ProxyGranting),
            (ProxyGranting, Proxy),
        ];
        for parent in TicketKind::ALL {
            for child in TicketKind::ALL {
                assert_eq!(
                    parent.can_parent(child),
                    allowed.contains(&(parent, child)),
                    "{parent} -> {child}"
                );
            }
        }
    }

    #[test]
    fn test_child_unlinking() {
        let now = Utc::now();
        let mut tgt = tgt(now);
        for id in ["ST-1", "ST-2", "ST-3"] {
            assert!(tgt.add_child(TicketId::new(id)));
        }

        assert!(tgt.remove_child(&TicketId::new("ST-1")));
        assert!(!tgt.remove_child(&TicketId::new("ST-1")));

        let pruned = tgt.retain_children(|id| id.as_str() == "ST-3");
        assert_eq!(pruned, 1);
        let left: Vec<_> = tgt.child_tickets().unwrap().iter().map(TicketId::as_str).collect();
        assert_eq!(left, vec!["ST-2"]);
    }

    #[test]
    fn test_relations_by_kind() {
        let now = Utc::now();
        let tgt = tgt(now);
        assert_eq!(tgt.kind(), TicketKind::TicketGranting);
        assert_eq!(tgt.parent(), None);
        assert_eq!(tgt.authentication().map(|a| a.principal.as_str()), Some("casuser"));
        assert!(tgt.service_id().is_none());

        let st = Ticket::service(
            TicketId::new("ST-2-bbbb"),
            tgt.id().clone(),
            "https://app.example",
            true,
            Arc::new(ExpirationPolicy::multi_use(1, Duration::from_secs(10))),
            now,
        );
        assert_eq!(st.parent(), Some(tgt.id()));
        assert_eq!(st.service_id(), Some("https://app.example"));
        assert!(st.authentication().is_none());
        assert!(st.child_tickets().is_none());
    }

    #[test]
    fn test_record_use_stamps() {
        let now = Utc::now();
        let mut ticket = tgt(now);
        let later = now + TimeDelta::seconds(30);
        ticket.record_use(later);

        assert_eq!(ticket.usage_count(), 1);
        assert_eq!(ticket.last_used_at(), later);
        assert_eq!(ticket.previous_used_at(), Some(now));
        assert_eq!(ticket.created_at(), now);
    }

    #[test]
    fn test_state_is_derived_from_policy() {
        let now = Utc::now();
        let mut st = Ticket::service(
            TicketId::new("ST-2-bbbb"),
            TicketId::new("TGT-1-aaaa"),
            "https://app.example",
            false,
            Arc::new(ExpirationPolicy::multi_use(1, Duration::from_secs(10))),
            now,
        );
        assert_eq!(st.state(now), TicketState::Valid);
        assert_eq!(st.state(now + TimeDelta::seconds(11)), TicketState::Expired);

        st.record_use(now);
        assert_eq!(st.state(now), TicketState::Consumed);
    }

    #[test]
    fn test_merge_never_moves_usage_backwards() {
        let now = Utc::now();
        let mut stored = tgt(now);
        stored.record_use(now + TimeDelta::seconds(20));
        stored.add_child(TicketId::new("ST-5-x"));

        let mut stale = tgt(now);
        stale.record_use(now + TimeDelta::seconds(10));
        stale.record_service("https://a.example", TicketId::new("ST-4-x"), now);

        stored.merge_from(&stale);
        assert_eq!(stored.last_used_at(), now + TimeDelta::seconds(20));
        assert_eq!(stored.usage_count(), 1);
        assert!(stored.granting().unwrap().services.contains_key("https://a.example"));
        assert!(stored.child_tickets().unwrap().contains(&TicketId::new("ST-5-x")));
    }

    #[test]
    fn test_ticket_serde_round_trip() {
        let now = Utc::now();
        let mut ticket = tgt(now);
        ticket.record_service("https://a.example", TicketId::new("ST-4-x"), now);
        ticket.add_child(TicketId::new("ST-4-x"));

        let json = serde_json::to_vec(&ticket).unwrap();
        let back: Ticket = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, ticket);
    }
}
