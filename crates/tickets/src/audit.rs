//! Audit trail for ticket lifecycle events.
//!
//! Every grant, consumption, revocation and expiry produces an
//! [`AuditEvent`] carrying the ticket id, kind and timestamp. Throttling and
//! compliance tooling read these events; they never write to the registry.
//!
//! # Architecture
//!
//! The [`AuditLogger`] trait enables different audit backends:
//!
//! - [`TracingAuditLogger`]: Emits structured `tracing` events at INFO, suitable for log
//!   aggregation and SIEM integration.
//! - [`NoopAuditLogger`]: Discards events.
//!
//! # Usage
//!
//! ```no_run
//! use sso_tickets::{AuditAction, AuditEvent, AuditLogger, AuditResult, TicketId, TicketKind, TracingAuditLogger};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let event = AuditEvent::builder()
//!     .action(AuditAction::GrantTicket)
//!     .ticket_id(TicketId::new("TGT-1-ab12"))
//!     .kind(TicketKind::TicketGranting)
//!     .result(AuditResult::Success)
//!     .build();
//! TracingAuditLogger.log(&event).await;
//! # });
//! ```

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ticket::{TicketId, TicketKind};

/// Lifecycle transition being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// A ticket was issued.
    GrantTicket,
    /// A one-time ticket was presented for validation.
    ConsumeTicket,
    /// A ticket was removed by logout or cascading revocation.
    RevokeTicket,
    /// A ticket was removed by the expiration sweep.
    ExpireTicket,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GrantTicket => write!(f, "grant_ticket"),
            Self::ConsumeTicket => write!(f, "consume_ticket"),
            Self::RevokeTicket => write!(f, "revoke_ticket"),
            Self::ExpireTicket => write!(f, "expire_ticket"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditResult {
    /// Operation completed successfully.
    Success,
    /// Operation failed with the given reason.
    Failure(String),
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// Structured audit event for one ticket.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct AuditEvent {
    /// When the event occurred (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// The transition.
    pub action: AuditAction,
    /// The ticket concerned.
    pub ticket_id: TicketId,
    /// Its kind.
    pub kind: TicketKind,
    /// Outcome.
    pub result: AuditResult,
    /// Additional context (service, parent, revocation root). Never the
    /// authentication payload.
    #[builder(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Trait for audit log backends.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Records an audit event.
    async fn log(&self, event: &AuditEvent);
}

#[async_trait]
impl<L: AuditLogger + ?Sized> AuditLogger for std::sync::Arc<L> {
    async fn log(&self, event: &AuditEvent) {
        (**self).log(event).await;
    }
}

/// Audit logger that emits structured `tracing` events.
///
/// Field mapping:
/// - `audit.timestamp`: RFC 3339 timestamp
/// - `audit.action`: e.g. "consume_ticket"
/// - `audit.ticket_id` / `audit.kind`: the ticket concerned
/// - `audit.result`: "success" or "failure: ..."
/// - `audit.metadata`: additional context
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        let metadata_str =
            event.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");

        tracing::info!(
            audit.timestamp = %event.timestamp.to_rfc3339(),
            audit.action = %event.action,
            audit.ticket_id = %event.ticket_id,
            audit.kind = %event.kind,
            audit.result = %event.result,
            audit.metadata = %metadata_str,
            "audit_event"
        );
    }
}

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLogger;

#[async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _event: &AuditEvent) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn event() -> AuditEvent {
        AuditEvent::builder()
            .action(AuditAction::ConsumeTicket)
            .ticket_id(TicketId::new("ST-7-abcd"))
            .kind(TicketKind::Service)
            .result(AuditResult::Failure("already consumed".to_owned()))
            .metadata(BTreeMap::from([("service".to_owned(), "https://a.example".to_owned())]))
            .build()
    }

    #[test]
    fn test_display() {
        assert_eq!(AuditAction::GrantTicket.to_string(), "grant_ticket");
        assert_eq!(AuditAction::ConsumeTicket.to_string(), "consume_ticket");
        assert_eq!(AuditAction::RevokeTicket.to_string(), "revoke_ticket");
        assert_eq!(AuditAction::ExpireTicket.to_string(), "expire_ticket");
        assert_eq!(AuditResult::Success.to_string(), "success");
        assert_eq!(AuditResult::Failure("x".to_owned()).to_string(), "failure: x");
    }

    #[test]
    fn test_builder_defaults() {
        let event = AuditEvent::builder()
            .action(AuditAction::GrantTicket)
            .ticket_id(TicketId::new("TGT-1-ab"))
            .kind(TicketKind::TicketGranting)
            .result(AuditResult::Success)
            .build();
        assert!(event.metadata.is_empty());
        assert!((Utc::now() - event.timestamp).num_seconds() < 2);
    }

    #[tokio::test]
    async fn test_tracing_logger_emits_structured_fields() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer().with_writer(captured.clone()).with_ansi(false),
        );
        let _guard = tracing::subscriber::set_default(subscriber);

        TracingAuditLogger.log(&event()).await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("audit_event"));
        assert!(output.contains("audit.action=consume_ticket"));
        assert!(output.contains("audit.ticket_id=ST-7-abcd"));
        assert!(output.contains("audit.result=failure: already consumed"));
        assert!(output.contains("service=https://a.example"));
    }

    #[tokio::test]
    async fn test_arc_and_noop_loggers() {
        let logger: Arc<dyn AuditLogger> = Arc::new(NoopAuditLogger);
        logger.log(&event()).await;
    }
}
