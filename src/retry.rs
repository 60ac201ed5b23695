//! Retry with exponential backoff for balance-service calls.
//!
//! Only errors the caller classifies as transient are retried. Every retried
//! call must carry an idempotency key so a request that actually landed
//! before the transport failed is not applied twice.

use crate::config::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is reached.
pub async fn with_backoff<F, Fut, T, E, R>(
    settings: &RetrySettings,
    what: &str,
    mut op: F,
    is_retriable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < settings.max_attempts && is_retriable(&e) => {
                let backoff = backoff_for(settings, attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = settings.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_for(settings: &RetrySettings, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    settings
        .base_backoff
        .saturating_mul(factor)
        .min(settings.max_backoff)
}
