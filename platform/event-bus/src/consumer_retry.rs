//! Bounded retry with exponential backoff
//!
//! Used in two places:
//! - connecting the producer session and subscription consumers at startup
//! - optionally re-running a failing handler in place before the message is
//!   diverted to the dead-letter queue
//!
//! There is no unbounded retry anywhere on the bus.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after each failed attempt
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Exactly one attempt, no retry
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same backoff curve with a different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "producer_connect")
///
/// # Returns
/// * `Ok(T)` if operation succeeds within max_attempts
/// * `Err(E)` with the last error if all attempts are exhausted
///
/// # Example
/// ```rust
/// use clinical_event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(operation, |_| true, config, context).await
}

/// Like [`retry_with_backoff`], but stops early when `is_retriable` rejects
/// the error
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation: F,
    is_retriable: P,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts || !is_retriable(&e) {
                    if max_attempts > 1 {
                        warn!(
                            context = %context,
                            attempts = attempt,
                            error = %e,
                            "Operation failed, giving up"
                        );
                    }
                    return Err(e);
                }

                let backoff = config.backoff_after(attempt);
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
            }
        }
    }
}
