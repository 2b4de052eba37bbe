//! Generic retry combinator.
//!
//! Retry never lives inside handler code; operations that may transiently
//! fail are wrapped in [`with_policy`], parameterized by backoff policy and
//! a retryability predicate.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::debug;

/// Exponential backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: false,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Backoff before attempt number `next_attempt` (2-based: the delay
    /// preceding the second attempt is the base delay).
    #[must_use]
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.5..1.5);
            raw.mul_f64(factor)
        } else {
            raw
        }
    }
}

/// Run `op` until it succeeds, the error is not retryable, or attempts are
/// exhausted. The final error is returned unchanged.
pub async fn with_policy<T, E, F, Fut, P>(
    policy: RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.delay_before(attempt + 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.delay_before(2), Duration::from_secs(5));
        assert_eq!(policy.delay_before(3), Duration::from_secs(10));
        assert_eq!(policy.delay_before(4), Duration::from_secs(20));
    }

    #[test]
    fn jittered_backoff_stays_in_band() {
        let policy = RetryPolicy::new(3, Duration::from_secs(4)).with_jitter();
        for _ in 0..32 {
            let delay = policy.delay_before(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(6));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_policy(
            RetryPolicy::new(3, Duration::from_millis(10)),
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_policy(
            RetryPolicy::new(3, Duration::from_millis(1)),
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_policy(
            RetryPolicy::new(3, Duration::from_millis(1)),
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("always".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
