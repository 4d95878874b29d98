//! Shared test utilities for ticket registries and the ticket service.
//!
//! Fixtures with fixed policies, recording audit and logout sinks, a
//! [`Harness`] wiring them to a [`TicketService`], and assertion macros.
//! Feature-gated behind `testutil` so that it never ends up in production
//! builds.
//!
//! ```toml
//! [dev-dependencies]
//! sso-tickets = { path = "../tickets", features = ["testutil"] }
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    audit::{AuditAction, AuditEvent, AuditLogger},
    clock::ManualClock,
    config::TicketConfig,
    expiration::ExpirationPolicy,
    logout::{LogoutNotification, LogoutNotifier},
    registry::TicketRegistry,
    service::TicketService,
    ticket::{Authentication, Ticket, TicketId},
};

/// Hard lifetime of fixture TGTs and PGTs.
pub const GRANTING_MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Idle timeout of fixture TGTs and PGTs.
pub const GRANTING_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Time-to-live of fixture STs and PTs.
pub const ONE_TIME_TTL: Duration = Duration::from_secs(10);

/// The service fixture STs are bound to.
pub const APP: &str = "https://app.example";

/// An authentication for `principal`.
#[must_use]
pub fn authentication(principal: &str) -> Authentication {
    Authentication::builder().principal(principal).build()
}

/// Policy of fixture TGTs and PGTs.
#[must_use]
pub fn granting_policy() -> Arc<ExpirationPolicy> {
    Arc::new(ExpirationPolicy::ticket_granting(GRANTING_MAX_LIFETIME, GRANTING_IDLE_TIMEOUT))
}

/// Policy of fixture STs and PTs: one use within [`ONE_TIME_TTL`].
#[must_use]
pub fn one_time_policy() -> Arc<ExpirationPolicy> {
    Arc::new(ExpirationPolicy::multi_use(1, ONE_TIME_TTL))
}

/// A TGT for `casuser`.
#[must_use]
pub fn tgt(id: &str, now: DateTime<Utc>) -> Ticket {
    Ticket::ticket_granting(TicketId::new(id), authentication("casuser"), granting_policy(), now)
}

/// A one-time ST owned by `parent`.
#[must_use]
pub fn st(id: &str, parent: &str, service: &str, now: DateTime<Utc>) -> Ticket {
    Ticket::service(TicketId::new(id), TicketId::new(parent), service, false, one_time_policy(), now)
}

/// A PGT for `service`, owned by `parent` and produced by `proxied_by`.
#[must_use]
pub fn pgt(id: &str, parent: &str, proxied_by: &str, service: &str, now: DateTime<Utc>) -> Ticket {
    Ticket::proxy_granting(
        TicketId::new(id),
        TicketId::new(parent),
        authentication("casuser"),
        TicketId::new(proxied_by),
        service,
        granting_policy(),
        now,
    )
}

/// A one-time PT owned by the PGT `parent`.
#[must_use]
pub fn pt(id: &str, parent: &str, service: &str, now: DateTime<Utc>) -> Ticket {
    Ticket::proxy(TicketId::new(id), TicketId::new(parent), service, one_time_policy(), now)
}

/// Audit logger keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLogger {
    /// Every event logged so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events with the given action.
    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|event| event.action == action).cloned().collect()
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl AuditLogger for RecordingAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Logout notifier keeping every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingLogoutNotifier {
    notifications: Mutex<Vec<LogoutNotification>>,
}

impl RecordingLogoutNotifier {
    /// Every notification delivered so far.
    pub fn notifications(&self) -> Vec<LogoutNotification> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl LogoutNotifier for RecordingLogoutNotifier {
    async fn notify(&self, notifications: &[LogoutNotification]) {
        self.notifications.lock().extend_from_slice(notifications);
    }
}

/// A [`TicketService`] wired to a manual clock and recording sinks.
pub struct Harness<R> {
    /// Drives every expiry decision.
    pub clock: Arc<ManualClock>,
    /// Receives the service's audit events.
    pub audit: Arc<RecordingAuditLogger>,
    /// Receives the service's logout notifications.
    pub notifier: Arc<RecordingLogoutNotifier>,
    /// The service under test.
    pub service: TicketService<R>,
}

/// Builds a [`Harness`] with default ticket settings.
///
/// `make_registry` receives the harness clock so that the registry and the
/// service agree on time.
///
/// # Panics
///
/// Panics if the service cannot be built.
pub fn harness<R, F>(make_registry: F) -> Harness<R>
where
    R: TicketRegistry,
    F: FnOnce(Arc<ManualClock>) -> R,
{
    harness_with_config(TicketConfig::default(), make_registry)
}

/// Builds a [`Harness`] with custom ticket settings.
///
/// # Panics
///
/// Panics if `config` is invalid.
pub fn harness_with_config<R, F>(config: TicketConfig, make_registry: F) -> Harness<R>
where
    R: TicketRegistry,
    F: FnOnce(Arc<ManualClock>) -> R,
{
    let clock = Arc::new(ManualClock::starting_now());
    let audit = Arc::new(RecordingAuditLogger::default());
    let notifier = Arc::new(RecordingLogoutNotifier::default());
    let service = TicketService::builder()
        .registry(make_registry(clock.clone()))
        .config(config)
        .clock(clock.clone())
        .audit(audit.clone())
        .notifier(notifier.clone())
        .build()
        .expect("test service should build");
    Harness { clock, audit, notifier, service }
}

/// Assert that a [`TicketResult`](crate::TicketResult) is the given
/// [`TicketError`](crate::TicketError) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use sso_tickets::{TicketError, TicketId, TicketResult, assert_ticket_err};
///
/// let result: TicketResult<()> = Err(TicketError::not_found(&TicketId::new("ST-1")));
/// assert_ticket_err!(result, NotFound);
/// ```
#[macro_export]
macro_rules! assert_ticket_err {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::TicketError::$variant { .. })),
            "expected TicketError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::TicketError::$variant { .. })),
            "{}: expected TicketError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

/// Assert that a [`TicketResult`](crate::TicketResult) is `Ok`, returning
/// the inner value.
#[macro_export]
macro_rules! assert_ticket_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got TicketError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got TicketError: {e:?}", $msg),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditResult,
        clock::Clock,
        error::{TicketError, TicketResult},
        registry::MemoryTicketRegistry,
        ticket::TicketKind,
    };

    #[test]
    fn test_fixtures_have_expected_relations() {
        let now = Utc::now();
        assert_eq!(tgt("TGT-1", now).kind(), TicketKind::TicketGranting);
        assert_eq!(st("ST-2", "TGT-1", APP, now).parent(), Some(&TicketId::new("TGT-1")));
        let pgt = pgt("PGT-3", "TGT-1", "ST-2", APP, now);
        assert_eq!(pgt.granting().unwrap().proxied_by, Some(TicketId::new("ST-2")));
        assert_eq!(pt("PT-4", "PGT-3", APP, now).kind(), TicketKind::Proxy);
    }

    #[tokio::test]
    async fn test_harness_records_audit_events() {
        let harness = harness(|clock| MemoryTicketRegistry::new(clock));
        let tgt = harness.service.grant_ticket_granting_ticket(authentication("casuser")).await;
        let tgt = assert_ticket_ok!(tgt);

        let events = harness.audit.events_for(AuditAction::GrantTicket);
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].ticket_id, tgt.id());
        assert_eq!(events[0].result, AuditResult::Success);
        assert_eq!(events[0].timestamp, harness.clock.now());

        harness.audit.clear();
        assert!(harness.audit.events().is_empty());
    }

    #[test]
    fn test_assert_macros() {
        let err: TicketResult<()> = Err(TicketError::expired(&TicketId::new("ST-1")));
        assert_ticket_err!(err, Expired);

        let ok: TicketResult<u32> = Ok(3);
        assert_eq!(assert_ticket_ok!(ok), 3);
    }
}
