//! Periodic expiration sweep.
//!
//! [`RegistryCleaner`] calls [`TicketService::clean_expired`] every
//! [`RegistryConfig::sweep_interval`]. Reads and `consume` already refuse expired tickets, so
//! the sweep only reclaims space and sends logout notifications for
//! sessions that timed out.
//!
//! The task holds a [`Weak`] reference to the service: it stops when the
//! service is dropped, when [`RegistryCleaner::shutdown`] is called, or when
//! the cleaner itself is dropped.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{select, sync::watch, task::JoinHandle, time::interval};

use crate::{
    config::RegistryConfig,
    error::TicketResult,
    registry::TicketRegistry,
    service::TicketService,
};

/// Handle to the background expiration sweep.
pub struct RegistryCleaner {
    shutdown_tx: watch::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryCleaner {
    /// Spawns the sweep on the current Tokio runtime.
    ///
    /// The first sweep runs after one full `sweep_interval` of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`](crate::TicketError::Config) if `config` does not validate.
    pub fn spawn<R>(service: &Arc<TicketService<R>>, config: &RegistryConfig) -> TicketResult<Self>
    where
        R: TicketRegistry + 'static,
    {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let weak = Arc::downgrade(service);
        let handle = tokio::spawn(sweep_loop(weak, config.sweep_interval, shutdown_rx));
        tracing::debug!(interval_ms = config.sweep_interval.as_millis() as u64, "expiration sweep started");
        Ok(Self { shutdown_tx, handle: Some(handle) })
    }

    /// Stops the sweep and waits for a running pass to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "expiration sweep task ended abnormally");
            }
        }
    }
}

impl Drop for RegistryCleaner {
    fn drop(&mut self) {
        // Best-effort signal; the task may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

async fn sweep_loop<R: TicketRegistry>(
    service: Weak<TicketService<R>>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticks = interval(sweep_interval);
    // The first tick completes immediately.
    ticks.tick().await;

    loop {
        select! {
            _ = ticks.tick() => {}
            _ = shutdown_rx.changed() => {
                tracing::debug!("expiration sweep stopped");
                return;
            }
        }

        let Some(service) = service.upgrade() else {
            return;
        };

        if let Err(err) = service.clean_expired().await {
            tracing::warn!(error = %err, "expiration sweep failed");
        }
    }
}
