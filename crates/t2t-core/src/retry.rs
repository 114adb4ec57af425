//! Retry and backoff for transient source and sink failures.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) ± 25% jitter.
//!
//! `max_retries` counts retries after the first failure, so an operation
//! that keeps failing is attempted `max_retries + 1` times before the error
//! is surfaced as fatal.

use crate::Error;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Initial delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retries allowed after the first failure
    pub max_retries: u32,
    /// Whether to add ±25% jitter
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl From<&crate::config::RetryConfig> for Backoff {
    fn from(config: &crate::config::RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            max_retries: config.max_retries,
            jitter: config.jitter,
        }
    }
}

/// How a retried operation ended without success.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Error was not retryable or the retry budget ran out
    Exhausted { error: Error, attempts: u32 },
    /// Cancellation arrived while waiting to retry
    Cancelled,
}

impl Backoff {
    /// Create a backoff policy with jitter enabled.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }

    /// Whether a failure on zero-based `attempt` should be retried.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Log a retried failure and sleep for the backoff of zero-based
    /// `attempt`. Returns `false` when `cancel` fires before the sleep ends.
    pub async fn wait(
        &self,
        what: &str,
        partition: i32,
        attempt: u32,
        error: &Error,
        cancel: &CancellationToken,
    ) -> bool {
        let delay = self.calculate_delay(attempt);
        warn!(
            operation = what,
            partition = partition,
            attempt = attempt + 1,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying after backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, exhausts
    /// the retry budget or `cancel` fires during a backoff sleep.
    ///
    /// `on_retry` is called once per retried failure.
    pub async fn retry<T, F, Fut>(
        &self,
        what: &str,
        partition: i32,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(&Error),
        mut op: F,
    ) -> std::result::Result<T, RetryOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    on_retry(&e);
                    if !self.wait(what, partition, attempt, &e, cancel).await {
                        return Err(RetryOutcome::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RetryOutcome::Exhausted {
                        error: e,
                        attempts: attempt + 1,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CheckpointError, PublishError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn publish_timeout() -> Error {
        PublishError::Timeout {
            partition: 0,
            timeout_ms: 10,
        }
        .into()
    }

    #[test]
    fn test_backoff_default() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
        assert_eq!(backoff.max_retries, 10);
        assert!(backoff.jitter);
    }

    #[test]
    fn test_backoff_from_config() {
        let config = crate::config::RetryConfig {
            retry_backoff_ms: 20,
            max_backoff_ms: 200,
            max_retries: 3,
            jitter: false,
        };
        let backoff = Backoff::from(&config);
        assert_eq!(backoff.base_delay, Duration::from_millis(20));
        assert_eq!(backoff.max_delay, Duration::from_millis(200));
        assert_eq!(backoff.max_retries, 3);
        assert!(!backoff.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 10).without_jitter();

        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 10).without_jitter();

        assert_eq!(backoff.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(backoff.calculate_delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = backoff.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_should_retry_respects_budget_and_kind() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 2);
        assert!(backoff.should_retry(&publish_timeout(), 0));
        assert!(backoff.should_retry(&publish_timeout(), 1));
        assert!(!backoff.should_retry(&publish_timeout(), 2));

        let fatal: Error = CheckpointError::WriteFailed("fsync".into()).into();
        assert!(!backoff.should_retry(&fatal, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 5).without_jitter();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut retries = 0;

        let result = backoff
            .retry(
                "publish",
                0,
                &cancel,
                |_| retries += 1,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(publish_timeout())
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;

        assert!(matches!(result, Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 2).without_jitter();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = backoff
            .retry(
                "publish",
                0,
                &cancel,
                |_| {},
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(publish_timeout()) }
                },
            )
            .await;

        match result {
            Err(RetryOutcome::Exhausted { attempts, error }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, Error::Publish(_)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_fatal_errors() {
        let backoff = Backoff::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = backoff
            .retry(
                "commit",
                1,
                &cancel,
                |_| {},
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CheckpointError::Unavailable("gone".into()).into()) }
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryOutcome::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let backoff =
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60), 5).without_jitter();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: std::result::Result<(), _> = backoff
            .retry(
                "pull",
                0,
                &cancel,
                |_| {},
                || async { Err(publish_timeout()) },
            )
            .await;

        assert!(matches!(result, Err(RetryOutcome::Cancelled)));
    }
}
