//! Retry policy for directory API calls.
//!
//! The policy is a plain value handed to the gateway, so each integration can
//! be tested with its own attempt budget and backoff curve.

use std::future::Future;
use std::time::Duration;

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2,
        }
    }

    /// Whether another attempt should follow `attempt` (1-based) failing with `error`.
    pub fn should_retry(&self, attempt: u32, error: &ApiError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Backoff after the given failed attempt (1-based).
    ///
    /// A rate-limit `retry_after` hint wins over the exponential curve; both
    /// are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &ApiError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint.min(self.max_delay);
        }

        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> ApiResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if self.should_retry(attempt, &error) => {
                    let delay = self.delay_for(attempt, &error);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    if error.is_retryable() {
                        tracing::warn!(
                            operation,
                            attempts = attempt,
                            error = %error,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn unavailable() -> ApiError {
        ApiError::TransientServer {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::default();
        let err = unavailable();

        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3, &err), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4, &err), Duration::from_secs(16));
        assert_eq!(policy.delay_for(6, &err), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40, &err), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_hint_wins_and_is_capped() {
        let policy = RetryPolicy::default();
        let hinted = ApiError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(11)),
        };
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(11));

        let huge = ApiError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.delay_for(1, &huge), Duration::from_secs(60));
    }

    #[test]
    fn test_should_retry_respects_budget_and_kind() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &unavailable()));
        assert!(policy.should_retry(4, &unavailable()));
        assert!(!policy.should_retry(5, &unavailable()));
        assert!(!policy.should_retry(1, &ApiError::NotFound("team".into())));
        assert!(!policy.should_retry(1, &ApiError::Authentication("401".into())));
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let policy = RetryPolicy::immediate(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy
            .execute("flaky", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(unavailable())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_stops_after_budget() {
        let policy = RetryPolicy::immediate(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: ApiResult<()> = policy
            .execute("down", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unavailable())
                }
            })
            .await;

        assert!(matches!(result, Err(ApiError::TransientServer { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_on_validation() {
        let policy = RetryPolicy::immediate(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: ApiResult<()> = policy
            .execute("bad", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Validation {
                        status: 400,
                        message: "bad request".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sleeps_between_attempts() {
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();

        let _: ApiResult<()> = policy
            .execute("slow", |_| async { Err(unavailable()) })
            .await;

        // 2 + 4 + 8 + 16 seconds between five attempts
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
