//! Ticket issuance, validation and revocation.
//!
//! [`TicketService`] drives the ticket lifecycle on top of any
//! [`TicketRegistry`]:
//!
//! | Operation | Produces | Consumes |
//! |-----------|----------|----------|
//! | [`grant_ticket_granting_ticket`](TicketService::grant_ticket_granting_ticket) | TGT | authentication |
//! | [`grant_service_ticket`](TicketService::grant_service_ticket) | ST | TGT (use recorded) |
//! | [`validate_service_ticket`](TicketService::validate_service_ticket) | [`Assertion`] | ST or PT |
//! | [`grant_proxy_granting_ticket`](TicketService::grant_proxy_granting_ticket) | PGT | ST or PT |
//! | [`grant_proxy_ticket`](TicketService::grant_proxy_ticket) | PT | PGT (use recorded) |
//! | [`revoke`](TicketService::revoke) | [`Revocation`] | TGT or PGT subtree |
//! | [`clean_expired`](TicketService::clean_expired) | [`CleanupReport`] | expired tickets |
//!
//! Every operation emits an [`AuditEvent`]. Authentication payloads are
//! never logged or audited.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use sso_tickets::{Authentication, MemoryTicketRegistry, SystemClock, TicketService};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let registry = MemoryTicketRegistry::new(Arc::new(SystemClock));
//! let service = TicketService::builder().registry(registry).build().unwrap();
//!
//! let tgt = service
//!     .grant_ticket_granting_ticket(Authentication::builder().principal("casuser").build())
//!     .await
//!     .unwrap();
//! let st = service.grant_service_ticket(tgt.id(), "https://app.example", false).await.unwrap();
//!
//! let assertion = service.validate_service_ticket(st.id(), "https://app.example").await.unwrap();
//! assert_eq!(assertion.authentication.principal, "casuser");
//!
//! // One-time: the second validation fails.
//! assert!(service.validate_service_ticket(st.id(), "https://app.example").await.is_err());
//! # });
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use crate::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditResult, TracingAuditLogger},
    clock::{Clock, SystemClock},
    config::{ConfigWarning, TicketConfig, TicketPolicies},
    error::{TicketError, TicketResult},
    id::TicketIdGenerator,
    logout::{LogoutNotification, LogoutNotifier, TracingLogoutNotifier},
    registry::TicketRegistry,
    ticket::{Authentication, Ticket, TicketId, TicketKind},
};

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// The session's authentication.
    pub authentication: Authentication,
    /// The service the ticket was validated for.
    pub service: String,
    /// The validated ST or PT.
    pub ticket_id: TicketId,
    /// The TGT or PGT that issued the ticket.
    pub granting_ticket_id: TicketId,
    /// Whether the ticket came from fresh primary credentials.
    pub credential_provided: bool,
    /// Services that proxied on the way, nearest first. Empty for an ST.
    pub proxy_chain: Vec<String>,
}

/// Outcome of [`TicketService::revoke`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revocation {
    /// Removed live tickets, the revoked root first.
    pub revoked: Vec<TicketId>,
    /// One notification per distinct service in the removed subtree.
    pub notifications: Vec<LogoutNotification>,
}

impl Revocation {
    /// Returns `true` if nothing was revoked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

/// Outcome of one expiration sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Every ticket removed, descendants of expired tickets included.
    pub removed: Vec<TicketId>,
    /// Notifications for services of expired sessions.
    pub notifications: Vec<LogoutNotification>,
    /// Stale child links dropped from live TGTs and PGTs.
    pub pruned: usize,
    /// Expired tickets whose removal failed, and parents whose links could
    /// not be pruned; retried by the next sweep.
    pub failed: usize,
}

/// Issues, validates and revokes tickets.
pub struct TicketService<R> {
    registry: R,
    ids: TicketIdGenerator,
    policies: TicketPolicies,
    warnings: Vec<ConfigWarning>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLogger>,
    notifier: Arc<dyn LogoutNotifier>,
}

#[bon::bon]
impl<R: TicketRegistry> TicketService<R> {
    /// Creates a service over `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] if `config` is invalid or the
    /// operating system's entropy source is unusable.
    ///
    /// [`warnings`](Self::warnings) carries the findings of `config` and
    /// [`ConfigWarning::VolatileStorage`] for a registry that keeps tickets
    /// in process memory.
    #[builder]
    pub fn new(
        registry: R,
        #[builder(default)] config: TicketConfig,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        #[builder(default = Arc::new(TracingAuditLogger) as Arc<dyn AuditLogger>)]
        audit: Arc<dyn AuditLogger>,
        #[builder(default = Arc::new(TracingLogoutNotifier) as Arc<dyn LogoutNotifier>)]
        notifier: Arc<dyn LogoutNotifier>,
    ) -> TicketResult<Self> {
        let mut warnings = config.validate()?;
        if registry.is_volatile() {
            warnings.insert(0, ConfigWarning::VolatileStorage);
        }
        let ids = TicketIdGenerator::new(config.id_suffix.clone())?;
        Ok(Self { registry, ids, policies: config.policies(), warnings, clock, audit, notifier })
    }
}

impl<R: TicketRegistry> TicketService<R> {
    /// The underlying registry.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Findings about the configuration and the registry, for the operator.
    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    /// Starts an SSO session.
    ///
    /// A remember-me authentication gets the long-term policy.
    #[tracing::instrument(skip_all, fields(remember_me = authentication.remember_me))]
    pub async fn grant_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> TicketResult<Ticket> {
        let now = self.clock.now();
        let policy = if authentication.remember_me {
            Arc::clone(&self.policies.remember_me)
        } else {
            Arc::clone(&self.policies.ticket_granting)
        };
        let ticket = Ticket::ticket_granting(
            self.ids.next(TicketKind::TicketGranting),
            authentication,
            policy,
            now,
        );

        self.add(ticket, BTreeMap::new()).await
    }

    /// Mints an ST for `service` from the TGT `tgt_id`.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] or [`TicketError::Expired`] for an unusable
    /// TGT, in which case nothing is created. [`TicketError::InvalidKind`]
    /// if `tgt_id` is not a TGT.
    #[tracing::instrument(skip(self, tgt_id), fields(tgt_id = %tgt_id))]
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &TicketId,
        service: &str,
        credential_provided: bool,
    ) -> TicketResult<Ticket> {
        self.issue_one_time(tgt_id, TicketKind::Service, service, credential_provided).await
    }

    /// Mints a PT for `service` from the PGT `pgt_id`.
    #[tracing::instrument(skip(self, pgt_id), fields(pgt_id = %pgt_id))]
    pub async fn grant_proxy_ticket(&self, pgt_id: &TicketId, service: &str) -> TicketResult<Ticket> {
        self.issue_one_time(pgt_id, TicketKind::Proxy, service, false).await
    }

    /// Validates an ST or PT for `service`, consuming it.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`], [`TicketError::Expired`],
    /// [`TicketError::AlreadyConsumed`] or [`TicketError::ServiceMismatch`].
    /// A mismatched service burns the ticket.
    #[tracing::instrument(skip(self, ticket_id), fields(ticket_id = %ticket_id))]
    pub async fn validate_service_ticket(
        &self,
        ticket_id: &TicketId,
        service: &str,
    ) -> TicketResult<Assertion> {
        let kind = ticket_id.kind().unwrap_or(TicketKind::Service);
        let metadata = BTreeMap::from([("service".to_owned(), service.to_owned())]);

        let result = self.assert(ticket_id, service).await;
        let outcome = match &result {
            Ok(_) => AuditResult::Success,
            Err(err) => {
                tracing::debug!(error = %err, "validation failed");
                AuditResult::Failure(err.to_string())
            },
        };
        self.record(AuditAction::ConsumeTicket, ticket_id, kind, outcome, metadata).await;
        result
    }

    /// Validates an ST or PT for `service` and issues that service a PGT.
    ///
    /// The PGT is owned by the granting ticket that issued the validated
    /// ticket and inherits its authentication.
    #[tracing::instrument(skip(self, ticket_id), fields(ticket_id = %ticket_id))]
    pub async fn grant_proxy_granting_ticket(
        &self,
        ticket_id: &TicketId,
        service: &str,
    ) -> TicketResult<Ticket> {
        let assertion = self.validate_service_ticket(ticket_id, service).await?;
        let ticket = Ticket::proxy_granting(
            self.ids.next(TicketKind::ProxyGranting),
            assertion.granting_ticket_id.clone(),
            assertion.authentication,
            ticket_id.clone(),
            service,
            Arc::clone(&self.policies.proxy_granting),
            self.clock.now(),
        );

        let metadata = BTreeMap::from([
            ("parent".to_owned(), assertion.granting_ticket_id.to_string()),
            ("proxied_by".to_owned(), ticket_id.to_string()),
            ("service".to_owned(), service.to_owned()),
        ]);
        self.add(ticket, metadata).await
    }

    /// Ends a session: removes `id` with every descendant and notifies the
    /// services that took part.
    ///
    /// Revoking an unknown id is not an error and yields an empty
    /// [`Revocation`].
    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    pub async fn revoke(&self, id: &TicketId) -> TicketResult<Revocation> {
        let removed = self.registry.delete_with_children(id).await?;
        if removed.is_empty() {
            tracing::debug!("nothing to revoke");
            return Ok(Revocation::default());
        }

        let notifications = logout_notifications(id, &removed);
        if !notifications.is_empty() {
            self.notifier.notify(&notifications).await;
        }

        let metadata = BTreeMap::from([("root".to_owned(), id.to_string())]);
        for ticket in &removed {
            self.record(
                AuditAction::RevokeTicket,
                ticket.id(),
                ticket.kind(),
                AuditResult::Success,
                metadata.clone(),
            )
            .await;
        }

        tracing::debug!(revoked = removed.len(), notified = notifications.len(), "session revoked");
        Ok(Revocation { revoked: removed.iter().map(|t| t.id().clone()).collect(), notifications })
    }

    /// Removes every expired ticket together with its descendants.
    ///
    /// A ticket is removed when its own policy has expired or when its
    /// parent is gone. Expiry is decided again by the registry at removal
    /// time, so a ticket used after the sweep listed it survives. Links to
    /// children that no longer exist are pruned from the remaining TGTs
    /// and PGTs. Failures on single tickets are logged and counted; the
    /// next sweep retries them.
    ///
    /// # Errors
    ///
    /// Only fails if the registry cannot be enumerated.
    #[tracing::instrument(skip(self))]
    pub async fn clean_expired(&self) -> TicketResult<CleanupReport> {
        let now = self.clock.now();
        let tickets = self.registry.get_all().await?;
        let live: HashSet<&TicketId> = tickets.iter().map(Ticket::id).collect();

        let mut report = CleanupReport::default();
        let mut swept = HashSet::new();
        for ticket in &tickets {
            let orphaned = ticket.parent().is_some_and(|parent| !live.contains(parent));
            if swept.contains(ticket.id()) || (!orphaned && !ticket.is_expired(now)) {
                continue;
            }

            let removed = match self.registry.delete_if_expired(ticket.id()).await {
                Ok(removed) => removed,
                Err(err) => {
                    tracing::warn!(
                        ticket_id = %ticket.id(),
                        error = %err,
                        "failed to remove expired ticket"
                    );
                    report.failed += 1;
                    continue;
                },
            };
            if removed.is_empty() {
                continue;
            }

            let notifications = logout_notifications(ticket.id(), &removed);
            let metadata = BTreeMap::from([("root".to_owned(), ticket.id().to_string())]);
            for expired in &removed {
                self.record(
                    AuditAction::ExpireTicket,
                    expired.id(),
                    expired.kind(),
                    AuditResult::Success,
                    metadata.clone(),
                )
                .await;
            }
            swept.extend(removed.iter().map(|t| t.id().clone()));
            report.removed.extend(removed.iter().map(|t| t.id().clone()));
            report.notifications.extend(notifications);
        }

        for ticket in &tickets {
            let stale = ticket
                .child_tickets()
                .is_some_and(|children| children.iter().any(|child| !live.contains(child)));
            if !stale || swept.contains(ticket.id()) {
                continue;
            }
            match self.registry.prune_children(ticket.id()).await {
                Ok(pruned) => report.pruned += pruned,
                Err(err) => {
                    tracing::warn!(
                        ticket_id = %ticket.id(),
                        error = %err,
                        "failed to prune child links"
                    );
                    report.failed += 1;
                },
            }
        }

        if !report.notifications.is_empty() {
            self.notifier.notify(&report.notifications).await;
        }
        if report.removed.is_empty() {
            tracing::debug!("expiration sweep found nothing");
        } else {
            tracing::info!(
                removed = report.removed.len(),
                pruned = report.pruned,
                failed = report.failed,
                "expiration sweep finished"
            );
        }
        Ok(report)
    }

    async fn add(&self, ticket: Ticket, metadata: BTreeMap<String, String>) -> TicketResult<Ticket> {
        let result = self.registry.add(ticket.clone()).await;
        let outcome = match &result {
            Ok(()) => AuditResult::Success,
            Err(err) => AuditResult::Failure(err.to_string()),
        };
        self.record(AuditAction::GrantTicket, ticket.id(), ticket.kind(), outcome, metadata).await;
        result.map(|()| ticket)
    }

    async fn issue_one_time(
        &self,
        granting_id: &TicketId,
        kind: TicketKind,
        service: &str,
        credential_provided: bool,
    ) -> TicketResult<Ticket> {
        let policy = match kind {
            TicketKind::Proxy => &self.policies.proxy,
            _ => &self.policies.service,
        };

        let mut granting = self.registry.fetch(granting_id).await?;
        if !granting.kind().can_parent(kind) {
            return Err(TicketError::invalid_kind(granting_id, granting.kind(), kind.expected_parent()));
        }

        let now = self.clock.now();
        let id = self.ids.next(kind);
        let ticket = match kind {
            TicketKind::Proxy => Ticket::proxy(id, granting_id.clone(), service, Arc::clone(policy), now),
            _ => Ticket::service(
                id,
                granting_id.clone(),
                service,
                credential_provided,
                Arc::clone(policy),
                now,
            ),
        };

        let metadata = BTreeMap::from([
            ("parent".to_owned(), granting_id.to_string()),
            ("service".to_owned(), service.to_owned()),
        ]);
        let ticket = self.add(ticket, metadata).await?;

        granting.record_use(now);
        granting.record_service(service, ticket.id().clone(), now);
        self.registry.update(&granting).await?;
        Ok(ticket)
    }

    /// Consumes the ticket and resolves its session.
    async fn assert(&self, ticket_id: &TicketId, service: &str) -> TicketResult<Assertion> {
        let ticket = self.registry.consume(ticket_id, service).await?;
        let Some(data) = ticket.service_data() else {
            return Err(TicketError::invalid_kind(ticket_id, ticket.kind(), "service or proxy"));
        };

        let granting = self.registry.get(&data.parent).await?;
        let Some(authentication) = granting.authentication().cloned() else {
            return Err(TicketError::invalid_kind(granting.id(), granting.kind(), "granting"));
        };

        let mut proxy_chain = Vec::new();
        let mut current = granting;
        while current.kind() == TicketKind::ProxyGranting {
            let Some(relations) = current.granting() else { break };
            proxy_chain.extend(relations.proxy_service.clone());
            let Some(parent) = relations.parent.clone() else { break };
            current = self.registry.get(&parent).await?;
        }

        Ok(Assertion {
            authentication,
            service: service.to_owned(),
            ticket_id: ticket_id.clone(),
            granting_ticket_id: data.parent.clone(),
            credential_provided: data.credential_provided,
            proxy_chain,
        })
    }

    async fn record(
        &self,
        action: AuditAction,
        ticket_id: &TicketId,
        kind: TicketKind,
        result: AuditResult,
        metadata: BTreeMap<String, String>,
    ) {
        let event = AuditEvent::builder()
            .timestamp(self.clock.now())
            .action(action)
            .ticket_id(ticket_id.clone())
            .kind(kind)
            .result(result)
            .metadata(metadata)
            .build();
        self.audit.log(&event).await;
    }
}

/// One notification per distinct service recorded by the removed granting
/// tickets. The nearest ticket to the root wins for a service.
fn logout_notifications(session_id: &TicketId, removed: &[Ticket]) -> Vec<LogoutNotification> {
    let mut by_service: BTreeMap<&str, LogoutNotification> = BTreeMap::new();
    for granting in removed.iter().filter_map(Ticket::granting) {
        for (service, access) in &granting.services {
            by_service.entry(service.as_str()).or_insert_with(|| LogoutNotification {
                service: service.clone(),
                ticket_id: access.ticket_id.clone(),
                session_id: session_id.clone(),
            });
        }
    }
    by_service.into_values().collect()
}
