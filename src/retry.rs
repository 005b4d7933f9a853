//! Retry and timeout utilities.
//!
//! Transport-agnostic helpers for bounded retries with lightweight jitter.
//! The request dispatcher uses these for transient transport failures only;
//! rate-limit responses are never routed through here.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Default suitable for short interactive API requests.
    pub fn interactive() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            jitter: Duration::from_millis(50),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given retry. `attempt` is
    /// 1-based and names the attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number; `should_retry` decides whether a
/// given error is worth another attempt.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    unreachable!("max_attempts is always at least 1")
}

/// Bounds an async computation to `limit`, erroring once it runs over.
pub async fn with_timeout<T, Fut>(
    limit: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(limit, future).await
}

fn jitter_duration(max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }
    let limit = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    Duration::from_nanos(rand::thread_rng().gen_range(0..=limit))
}
