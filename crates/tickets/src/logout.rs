//! Single-logout notification fan-out.
//!
//! When a session ends, every distinct service that received a ticket from
//! it gets one [`LogoutNotification`]. Delivery (HTTP back-channel, message
//! bus, retries) belongs to the [`LogoutNotifier`] implementation.

use async_trait::async_trait;

use crate::ticket::TicketId;

/// Tells one service that a session it participated in has ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogoutNotification {
    /// The service to notify.
    pub service: String,
    /// The ticket that service received, which it uses to find its local session.
    pub ticket_id: TicketId,
    /// The granting ticket whose removal triggered the notification.
    pub session_id: TicketId,
}

/// Delivers single-logout notifications.
#[async_trait]
pub trait LogoutNotifier: Send + Sync {
    /// Hands a batch of notifications over for delivery.
    async fn notify(&self, notifications: &[LogoutNotification]);
}

#[async_trait]
impl<N: LogoutNotifier + ?Sized> LogoutNotifier for std::sync::Arc<N> {
    async fn notify(&self, notifications: &[LogoutNotification]) {
        (**self).notify(notifications).await;
    }
}

/// Notifier that logs each notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogoutNotifier;

#[async_trait]
impl LogoutNotifier for TracingLogoutNotifier {
    async fn notify(&self, notifications: &[LogoutNotification]) {
        for notification in notifications {
            tracing::info!(
                logout.service = %notification.service,
                logout.ticket_id = %notification.ticket_id,
                logout.session_id = %notification.session_id,
                "single_logout"
            );
        }
    }
}

/// Notifier that drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogoutNotifier;

#[async_trait]
impl LogoutNotifier for NoopLogoutNotifier {
    async fn notify(&self, _notifications: &[LogoutNotification]) {}
}
