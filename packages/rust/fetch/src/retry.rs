//! Retry-with-backoff for transient page-fetch failures.
//!
//! Exponential backoff with uniform jitter between attempts. Modeled as an
//! explicit attempt loop: try, classify the failure, recover by sleeping,
//! retry until the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Errors that can be classified as transient or permanent.
///
/// Transient failures (timeouts, connection resets, server overload) should
/// return `true`; permanent failures (4xx responses, bad URLs) `false`.
pub trait IsRetryable {
    /// Returns true if the operation should be retried.
    fn is_retryable(&self) -> bool;
}

/// Backoff policy for one fetch operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt budget, initial try included.
    pub attempts: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Cap on the delay between retries.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Run `operation` until it succeeds, its error is permanent, or the
/// attempt budget is exhausted. Returns the last error on exhaustion.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut delay = policy.base_backoff;
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                tracing::warn!(
                    error = %e,
                    attempt,
                    budget = policy.attempts,
                    delay_ms = delay.as_millis(),
                    "transient failure, backing off"
                );
                tokio::time::sleep(add_jitter(delay)).await;
                delay = (delay * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempts = attempt, "operation failed");
                return Err(e);
            }
        }
    }
}

/// Spread a delay uniformly over `[delay, 2*delay]` to avoid synchronized
/// retry bursts against the same host.
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}
