//! # Retry Policy
//!
//! Exponential backoff without jitter: `base * multiplier^(attempt - 1)`, capped
//! at `max_backoff_ms`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::ItemError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ItemError>,
    /// Attempts actually made, at least 1.
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with fixed, immediate retries. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.base_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &ItemError) -> bool {
        error.retryable && attempt < self.max_attempts.max(1)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(error) if self.should_retry(attempt, &error) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "🔁 RETRY: retrying after retryable failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1, &ItemError::permanent("bad")));
        assert!(policy.should_retry(1, &ItemError::retryable("flaky")));
        assert!(!policy.should_retry(3, &ItemError::retryable("flaky")));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = RetryPolicy::immediate(5)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(ItemError::retryable("not yet"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let outcome = RetryPolicy::immediate(2)
            .run(|_| async { Err::<(), _>(ItemError::retryable("down")) })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent_error() {
        let outcome = RetryPolicy::immediate(5)
            .run(|_| async { Err::<(), _>(ItemError::permanent("malformed")) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }
}
