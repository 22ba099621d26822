//! Exponential backoff retry.
//!
//! The default schedule (5 attempts, 2s initial delay, x2 backoff, 10s cap)
//! waits 2s, 4s, 8s and 10s between attempts, giving a removable drive or a
//! network mount roughly 24 seconds to come back before a transfer fails.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry schedule for a fallible operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before retry number `retry` (1-based: the wait after the first failure is retry 1).
    ///
    /// Computed in f64 and capped before conversion, so huge multipliers saturate at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.initial_delay.min(self.max_delay).as_secs_f64();
        if base == 0.0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sum of every inter-attempt delay.
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|r| self.delay_for_retry(r)).sum()
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the attempt budget is spent.
///
/// The operation receives the 1-based attempt number. There is no delay
/// before the first attempt. The error that ends the loop is returned
/// unchanged so callers can still inspect its classification.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !should_retry(&error) {
                    debug!(attempt, error = %error, "Error is not retryable");
                    return Err(error);
                }
                if attempt >= max_attempts {
                    warn!(
                        attempts = attempt,
                        waited_ms = config.total_delay().as_millis() as u64,
                        error = %error,
                        "Retry attempts exhausted"
                    );
                    return Err(error);
                }

                let delay = config.delay_for_retry(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
