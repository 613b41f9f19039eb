//! Retry policy for network-bound model calls.
//!
//! A [`RetryPolicy`] is a plain value: attempt bound, exponential backoff
//! schedule and jitter. The call site supplies the retryable-error predicate.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;

use crate::error::LlmError;

/// Default maximum number of attempts (first call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff with bounded attempts and random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base of the exponential schedule: the n-th retry waits `multiplier * 2^n`.
    pub multiplier: Duration,
    /// Lower bound of the backoff before jitter.
    pub min_delay: Duration,
    /// Upper bound of the backoff before jitter.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            multiplier: Duration::from_secs(1),
            min_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default schedule and the given attempt bound.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// A policy that retries without sleeping, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            multiplier: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Set the backoff bounds.
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// Set the maximum jitter.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Backoff before the given retry (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.multiplier
            .saturating_mul(factor)
            .clamp(self.min_delay, self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt bound is exhausted (the last error is returned).
    pub async fn run<T, F, Fut, P>(
        &self,
        operation: &str,
        mut call: F,
        is_retryable: P,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
        P: Fn(&LlmError) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    tracing::error!(
                        operation = operation,
                        attempts = attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff(attempt - 1) + self.jitter();
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Whether an error is transient and worth retrying.
///
/// Unparseable bodies count as transient since gateways truncate responses
/// under load. Authentication failures are never retried.
pub fn is_transient_error(error: &LlmError) -> bool {
    match error {
        LlmError::RequestFailed(_) | LlmError::RateLimited(_) | LlmError::ParseError(_) => true,
        LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule_is_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_is_transient_error() {
        assert!(is_transient_error(&LlmError::RateLimited("slow down".to_string())));
        assert!(is_transient_error(&LlmError::RequestFailed("reset".to_string())));
        assert!(is_transient_error(&LlmError::ApiError {
            code: 502,
            message: "bad gateway".to_string()
        }));
        assert!(!is_transient_error(&LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }));
        assert!(is_transient_error(&LlmError::ParseError("truncated body".to_string())));
        assert!(!is_transient_error(&LlmError::Authentication("no key".to_string())));
        assert!(!is_transient_error(&LlmError::InvalidConfig("bad".to_string())));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(5)
            .run(
                "test",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(LlmError::RateLimited("busy".to_string()))
                    } else {
                        Ok(7)
                    }
                },
                is_transient_error,
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = RetryPolicy::immediate(3)
            .run(
                "test",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::ApiError {
                        code: 503,
                        message: format!("attempt {}", n),
                    })
                },
                is_transient_error,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(LlmError::ApiError { message, .. }) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authentication_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = RetryPolicy::immediate(10)
            .run(
                "test",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::Authentication("bad key".to_string()))
                },
                is_transient_error,
            )
            .await;
        assert!(matches!(result, Err(LlmError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
