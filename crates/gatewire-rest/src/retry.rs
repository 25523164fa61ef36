//! Retry logic with exponential backoff.
//!
//! Used by the executor for server errors and transport failures, and by the
//! gateway when reconnecting.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{is_retryable, RestError, Result};

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// The last attempt failed permanently or retries ran out.
    Exhausted {
        /// The last error that occurred.
        last_error: RestError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Converts into a plain result, keeping the last error.
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retried operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying retryable errors with exponential backoff.
    ///
    /// Permanent errors fail immediately. At most `max_retries` retries
    /// follow the first attempt.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !is_retryable(&e) || attempt > self.config.max_retries {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Backoff before retry number `attempt` (zero-based).
    ///
    /// Computes `initial_backoff * backoff_multiplier^attempt`, capped at
    /// `max_backoff`. With jitter enabled, adds up to 50% on top.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff_ms as f64;
        let max_delay_ms = self.config.max_backoff_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(exponent);
        let capped = if computed.is_finite() {
            computed.min(max_delay_ms)
        } else {
            max_delay_ms
        } as u64;

        if self.config.jitter && capped >= 2 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpErrorDetail;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transport() -> RestError {
        RestError::Transport {
            reason: "connection reset".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_first_attempt() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, RestError>("success")
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("success")));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 3 {
                        Err(transport())
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("success")));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let executor = RetryExecutor::new(RetryConfig {
            max_retries: 2,
            ..Default::default()
        });

        let outcome: RetryOutcome<()> = executor
            .execute(|| async {
                Err(RestError::InternalServer(HttpErrorDetail::from_body(
                    "u", 502, b"",
                )))
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                last_error: RestError::InternalServer(_),
                attempts: 3
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_permanent_error() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(RestError::NotFound(HttpErrorDetail::from_body("u", 404, b"")))
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted { attempts: 1, .. }
        ));
        assert!(outcome.into_result().is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_compute_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
        });
        assert_eq!(executor.compute_backoff(0), Duration::from_millis(100));
        assert_eq!(executor.compute_backoff(1), Duration::from_millis(200));
        assert_eq!(executor.compute_backoff(2), Duration::from_millis(400));
        assert_eq!(executor.compute_backoff(20), Duration::from_secs(10));
        assert_eq!(executor.compute_backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_compute_backoff_jitter_bounds() {
        let executor = RetryExecutor::new(RetryConfig {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 1_000,
            jitter: true,
            ..Default::default()
        });
        for attempt in 0..50 {
            let backoff = executor.compute_backoff(attempt);
            assert!(backoff >= Duration::from_millis(1_000));
            assert!(backoff <= Duration::from_millis(1_500));
        }
    }
}
