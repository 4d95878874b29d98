//! Retry logic for transient registry failures.
//!
//! [`with_retry`] wraps an idempotent async read with automatic retry on
//! [`TicketError::BackendUnavailable`]. Every other error is returned
//! immediately. Consumption is never routed through here: a consume whose
//! outcome is unknown must be confirmed with a fresh read instead.
//!
//! [`with_cas_retry`] re-runs optimistic read-modify-write cycles that lost
//! a version race.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added so that nodes do not retry in lockstep

use std::{future::Future, time::Duration};

use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{TicketError, TicketResult},
};

/// Executes `operation`, retrying transient failures with backoff.
///
/// Returns the first success, or the last error once retries run out.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> TicketResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TicketResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Computes the backoff delay for a retry attempt, with jitter.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
    } else {
        capped
    }
}

/// Attempts allowed to a read-modify-write cycle that keeps losing races.
pub(crate) const CAS_MAX_ATTEMPTS: u32 = 16;

/// Base delay between compare-and-swap attempts.
const CAS_BASE_DELAY: Duration = Duration::from_millis(2);

/// Re-runs a read-modify-write cycle while it loses version races.
///
/// `operation` returns `Ok(None)` when its conditional write hit a conflict.
/// Every error is returned immediately; in particular transient failures
/// are never retried here, since the write may already have been applied.
#[tracing::instrument(skip(operation))]
pub(crate) async fn with_cas_retry<F, Fut, T>(operation_name: &str, mut operation: F) -> TicketResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TicketResult<Option<T>>>,
{
    for attempt in 0..CAS_MAX_ATTEMPTS {
        if let Some(value) = operation().await? {
            return Ok(value);
        }
        let range = CAS_BASE_DELAY.as_millis() as u64;
        let delay = CAS_BASE_DELAY + Duration::from_millis(rand::rng().random_range(0..=range));
        tracing::debug!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = CAS_MAX_ATTEMPTS,
            delay_ms = delay.as_millis() as u64,
            "version conflict, retrying after jitter",
        );
        tokio::time::sleep(delay).await;
    }

    tracing::warn!(operation = operation_name, attempts = CAS_MAX_ATTEMPTS, "contention retries exhausted");
    Err(TicketError::backend_unavailable(format!(
        "{operation_name} gave up after {CAS_MAX_ATTEMPTS} conflicting attempts"
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::ticket::TicketId;

    fn fast() -> RetryConfig {
        RetryConfig::builder()
            .max_retries(3)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(4))
            .build()
    }

    #[test]
    fn test_compute_backoff_exponential_and_capped() {
        let config = RetryConfig::builder()
            .max_retries(5)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(1_000))
            .build();

        for (attempt, base) in [(0, 100), (1, 200), (2, 400), (3, 800), (4, 1_000), (30, 1_000)] {
            let delay = compute_backoff(&config, attempt).as_millis() as u64;
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base + base / 2, "attempt {attempt}: {delay} too large");
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "get", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TicketError::backend_unavailable("connection reset"))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: TicketResult<()> = with_retry(&fast(), "get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TicketError::not_found(&TicketId::new("ST-1-x")))
        })
        .await;

        assert!(matches!(result, Err(TicketError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cas_retry_reruns_on_conflict() {
        let calls = AtomicU32::new(0);
        let result = with_cas_retry("update", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 { Ok(None) } else { Ok(Some("done")) }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cas_retry_never_retries_errors() {
        let calls = AtomicU32::new(0);
        let result: TicketResult<()> = with_cas_retry("consume", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TicketError::backend_unavailable("timeout"))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cas_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: TicketResult<()> = with_cas_retry("update", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await;

        assert!(matches!(result, Err(TicketError::BackendUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), CAS_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: TicketResult<()> = with_retry(&fast(), "get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TicketError::backend_unavailable("down"))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
