//! Exponential backoff for provider calls that fail transiently.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use snapmatch_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Randomize delays by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs an async operation, retrying it with backoff while it keeps failing
/// with a retryable error.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry on any transient error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_transient)
            .await
    }

    /// Retry only while `should_retry` accepts the error.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            let err = match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Operation succeeded after retrying");
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };

            if !should_retry(&err) {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                warn!(attempts = attempt + 1, error = %err, "Giving up on operation");
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(attempt);
            attempt += 1;
            warn!(attempt, error = %err, ?delay, "Operation failed, backing off");
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(1).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_rate_limited_call_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str> = fast(3)
            .execute(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::RateLimited("429".to_string()))
                    } else {
                        Ok("uploaded")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "uploaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast(3)
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("gone".to_string()))
                }
            })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_condition_limits_retries_to_rate_limits() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast(3)
            .execute_with_condition(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Network("reset".to_string()))
                    }
                },
                |e| matches!(e, Error::RateLimited(_)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast(2)
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::RateLimited("slow down".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
