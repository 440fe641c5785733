//! Bounded fixed-backoff retry for rate-limited external calls.
//!
//! Only rate-limit failures are retried. Everything else is returned to the
//! caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry budget for rate-limited calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `op`, retrying while `is_rate_limited` says the error is a rate limit
/// and the budget allows it.
pub async fn retry_rate_limited<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_rate_limited: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_rate_limited(&e) && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    call = label,
                    attempt,
                    max_retries = policy.max_retries,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    error = %e,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
