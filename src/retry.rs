//! Retry with exponential backoff and jitter for transient cluster errors.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::metrics::ClientMetrics;

/// Backoff parameters for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Amount of jitter to add (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Short fuse for latency-sensitive callers.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Executes operations with retry, consulting a caller-supplied predicate
/// to decide which errors are worth another attempt.
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Option<Arc<ClientMetrics>>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(config: RetryConfig, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            config,
            metrics: Some(metrics),
        }
    }

    pub async fn execute<T, F, Fut, E, R>(
        &self,
        operation_name: &str,
        operation: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        let mut delay = self.config.initial_delay;

        loop {
            if let Some(metrics) = &self.metrics {
                metrics.increment_retry_attempts();
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "operation succeeded after retry"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.increment_retry_successes();
                        }
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if attempt >= self.config.max_attempts || !retryable(&error) {
                        return Err(error);
                    }

                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "operation failed, retrying after delay"
                    );
                    sleep(delay).await;

                    let next_delay = delay.mul_f64(self.config.backoff_multiplier);
                    delay = next_delay.min(self.config.max_delay);
                    if self.config.jitter_factor > 0.0 {
                        let jitter_cap = delay.mul_f64(self.config.jitter_factor).as_millis() as u64;
                        delay += Duration::from_millis(fastrand::u64(0..=jitter_cap));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let executor = RetryExecutor::new(RetryConfig::fast());
        let result = executor
            .execute("noop", || async { Ok::<_, anyhow::Error>(7) }, |_| true)
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::fast());

        let counter_clone = counter.clone();
        let result = executor
            .execute(
                "flaky",
                move || {
                    let counter = counter_clone.clone();
                    async move {
                        let attempt = counter.fetch_add(1, Ordering::Relaxed) + 1;
                        if attempt < 3 {
                            Err(anyhow::anyhow!("transient"))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 2,
            ..RetryConfig::fast()
        });
        let result: Result<u32, _> = executor
            .execute(
                "hopeless",
                || async { Err(anyhow::anyhow!("transient")) },
                |_| true,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::fast());

        let counter_clone = counter.clone();
        let result: Result<u32, _> = executor
            .execute(
                "fatal",
                move || {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Err(anyhow::anyhow!("bad request"))
                    }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
