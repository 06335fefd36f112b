//! Bounded exponential backoff with jitter
//!
//! Used by the SSH runner for connection-class failures and by the
//! cluster executors for transient status-query failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry policy with bounded attempts and exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff interval
    pub max_backoff: Duration,
    /// Fraction of the backoff added as random jitter (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(6),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt bound and backoff window
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Compute the backoff for a given zero-based retry attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        if self.jitter <= 0.0 {
            return exp;
        }
        let jitter_fraction = rand::thread_rng().gen_range(0.0..self.jitter);
        exp + exp.mul_f64(jitter_fraction)
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs, or
    /// the attempt bound is exhausted. `is_retryable` decides which errors
    /// are worth another attempt.
    pub async fn retry<T, E, F, Fut, P>(&self, is_retryable: P, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    let backoff = self.backoff_for(attempt - 1);
                    tracing::debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = quick_policy(5);
        assert_eq!(policy.backoff_for(0), Duration::from_millis(1));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = quick_policy(4)
            .retry(
                |_| true,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = quick_policy(3)
            .retry(
                |_| true,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("always failing".to_string()) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = quick_policy(5)
            .retry(
                |e: &String| e.contains("transient"),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("protocol violation".to_string()) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
