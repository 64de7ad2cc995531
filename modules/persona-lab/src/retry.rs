//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// How many times to attempt an external call and how long to wait between
/// attempts. Delay for attempt `n` (0-based) is `base_delay * 3^n`, capped at
/// `max_delay`, plus up to `jitter` of random extra wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Retries without waiting. Used by tests and by callers that already
    /// rate-limit elsewhere.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::none()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 3u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter.is_zero() {
            return backoff;
        }
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy's
/// attempt budget is spent. Returns the final result and the number of
/// attempts made.
pub async fn retry_with<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> (Result<T, E>, u32)
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return (Ok(value), attempt + 1),
            Err(e) => {
                if attempt + 1 >= max_attempts || !is_retryable(&e) {
                    return (Err(e), attempt + 1);
                }
                let backoff = policy.delay_for(attempt);
                warn!(
                    call = label,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "External call failed, retrying after backoff"
                );
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_triples_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        };
        for _ in 0..50 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn stops_after_budget() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_with(
            &RetryPolicy::immediate(3),
            "test",
            |_: &String| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), String>("down".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_with(
            &RetryPolicy::immediate(5),
            "test",
            |e: &String| e != "fatal",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), String>("fatal".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_with(
            &RetryPolicy::immediate(4),
            "test",
            |_: &String| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 3);
    }
}
