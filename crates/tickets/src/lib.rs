//! Ticket lifecycle and registries for single sign-on sessions.
//!
//! A user authenticates once and receives a ticket-granting ticket (TGT).
//! The TGT mints one-time service tickets (STs) that applications validate
//! exactly once. Applications acting on the user's behalf obtain
//! proxy-granting tickets (PGTs), which mint one-time proxy tickets (PTs).
//! Ending a session removes the TGT together with everything issued from it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ TicketService                                                │
//! │   grant / validate / proxy / revoke / clean_expired          │
//! │   ├── TicketIdGenerator     ├── AuditLogger                  │
//! │   ├── TicketPolicies        └── LogoutNotifier               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ TicketRegistry (add, fetch, consume, update, delete, ...)    │
//! │   MemoryTicketRegistry   │   StorageTicketRegistry<B>        │
//! │   (RwLock + tombstones)  │   (version CAS over B)            │
//! ├──────────────────────────┴───────────────────────────────────┤
//! │ sso-ticket-storage: StorageBackend                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use sso_tickets::{Authentication, MemoryTicketRegistry, SystemClock, TicketError, TicketService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TicketError> {
//!     let registry = MemoryTicketRegistry::new(Arc::new(SystemClock));
//!     let service = TicketService::builder().registry(registry).build()?;
//!
//!     let tgt = service
//!         .grant_ticket_granting_ticket(Authentication::builder().principal("casuser").build())
//!         .await?;
//!     let st = service.grant_service_ticket(tgt.id(), "https://app.example", false).await?;
//!     let assertion = service.validate_service_ticket(st.id(), "https://app.example").await?;
//!     assert_eq!(assertion.authentication.principal, "casuser");
//!
//!     let revocation = service.revoke(tgt.id()).await?;
//!     assert_eq!(revocation.revoked, vec![tgt.id().clone()]);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Every operation returns [`TicketResult<T>`]. Invalid-ticket outcomes stay
//! distinct for audit; [`TicketError::protocol_message`] collapses them to
//! one message for the protocol boundary.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (fixtures, recording audit and logout sinks,
//!   assertion macros) and the `conformance` suite every registry implementation should pass.

#![deny(unsafe_code)]

pub mod audit;
pub mod cleaner;
pub mod clock;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod expiration;
pub mod id;
pub mod logout;
pub mod registry;
mod retry;
pub mod service;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod ticket;

// Re-export primary types at crate root for convenience
pub use audit::{AuditAction, AuditEvent, AuditLogger, AuditResult, NoopAuditLogger, TracingAuditLogger};
pub use cleaner::RegistryCleaner;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigWarning, RegistryConfig, RememberMeLifetime, RetryConfig, TicketConfig,
    TicketPolicies,
};
pub use error::{TicketError, TicketResult};
pub use expiration::{ExpirationPolicy, UsageStamps};
pub use id::TicketIdGenerator;
pub use logout::{LogoutNotification, LogoutNotifier, NoopLogoutNotifier, TracingLogoutNotifier};
pub use registry::{MemoryTicketRegistry, StorageTicketRegistry, TicketRegistry};
pub use service::{Assertion, CleanupReport, Revocation, TicketService};
pub use ticket::{
    Authentication, GrantingData, ServiceAccess, ServiceData, Ticket, TicketBody, TicketId, TicketKind,
    TicketState,
};
