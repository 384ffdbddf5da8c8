//! Bounded retry with exponential backoff and cancellation
//!
//! The operation receives the zero-based attempt index. Only errors for which
//! [`NimbusError::is_retryable`] holds are retried; everything else is returned
//! immediately. A cancelled backoff wait ends the whole operation with
//! [`NimbusError::Cancelled`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{NimbusError, NimbusResult};

/// Backoff strategy for retry operations
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// `base * 2^attempt`, where `attempt` is the index of the attempt that failed
    Exponential { base: Duration, max: Duration },
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let BackoffStrategy::Exponential { base, max } = self;
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        std::cmp::min(base.saturating_mul(factor), *max)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub operation_name: String,
}

impl RetryConfig {
    /// `max_retries` retries after the first attempt, doubling from `base`.
    pub fn exponential(operation_name: impl Into<String>, max_retries: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            backoff: BackoffStrategy::Exponential {
                base,
                max: Duration::from_secs(60),
            },
            operation_name: operation_name.into(),
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn cancellable_sleep(
    delay: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> NimbusResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(NimbusError::Cancelled {
            operation: operation.to_string(),
        }),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Retry `operation` according to `config`.
pub async fn retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> NimbusResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = NimbusResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} attempts", config.operation_name, attempt + 1);
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() || attempt + 1 >= max_attempts {
                    return Err(error);
                }

                let delay = config.backoff.delay(attempt);
                warn!(
                    "Retry attempt {}/{} for {} after error: {} (waiting {:?})",
                    attempt + 1,
                    max_attempts,
                    config.operation_name,
                    error,
                    delay
                );
                cancellable_sleep(delay, cancel, &config.operation_name).await?;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transport_error() -> NimbusError {
        NimbusError::Transport {
            operation: "test".to_string(),
            attempts: 1,
            details: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_exponential_delays() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let config = RetryConfig::exponential("test", 2, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result = retry(&config, &CancellationToken::new(), |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transport_error())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let config = RetryConfig::exponential("test", 5, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let result: NimbusResult<()> = retry(&config, &CancellationToken::new(), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NimbusError::not_found("thing"))
        })
        .await;

        assert!(matches!(result, Err(NimbusError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let config = RetryConfig::exponential("test", 3, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: NimbusResult<()> = retry(&config, &cancel, |_| async { Err(transport_error()) }).await;
        assert!(matches!(result, Err(NimbusError::Cancelled { .. })));
    }
}
