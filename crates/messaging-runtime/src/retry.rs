//! # Retry Policy Module
//!
//! Bounded retry with fixed or doubling backoff for the transmission step of
//! the send paths.
//!
//! Only broker round trips are wrapped in a [`RetryPolicy`]. Validation and
//! oversize failures are decided before the retry loop is entered.

use crate::connection::ConnectionOptions;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 5;

/// Default wait between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Retry policy configuration
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 5 retries, 1s interval, fixed backoff
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.total_attempts(), 6);
///
/// // Doubling backoff: 100ms, 200ms, 400ms
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), true);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt
    pub retries: u32,

    /// Wait before the first retry
    pub interval: Duration,

    /// Double the wait after every failed retry
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
            exponential: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(retries: u32, interval: Duration, exponential: bool) -> Self {
        Self {
            retries,
            interval,
            exponential,
        }
    }

    /// Build the policy from the `retries`, `retryWaitInMs` and
    /// `exponentialRetry` connection options
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self::new(
            options.retries,
            Duration::from_millis(options.retry_wait_in_ms),
            options.exponential_retry,
        )
    }

    /// Fresh state for one invocation of the policy
    pub fn state(&self) -> RetryState {
        RetryState::new(self.retries, self.interval, self.exponential)
    }

    /// Wait before retry `attempt` (0-based)
    ///
    /// Equals `interval * 2^attempt` when exponential, `interval` otherwise.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.interval;
        }

        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.interval.saturating_mul(factor)
    }

    /// Total number of attempts including the initial one
    pub fn total_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `operation` until it succeeds or the retries are used up.
    ///
    /// The operation runs once immediately. Each failure consumes one retry
    /// and waits the current interval before the next attempt. When no
    /// retries remain the last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut state = self.state();

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let failed_attempt = state.attempts_made();
            match state.next_delay() {
                Some(delay) => {
                    warn!(
                        attempt = failed_attempt,
                        retries_left = state.retries_left,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        attempts = state.attempts_made(),
                        error = %err,
                        "Operation failed; retries exhausted"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Mutable state owned by a single retry invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Retries still available
    pub retries_left: u32,

    /// Wait before the next retry
    pub interval: Duration,

    /// Double `interval` after each retry
    pub exponential: bool,

    retries_used: u32,
}

impl RetryState {
    /// Create new retry state
    pub fn new(retries_left: u32, interval: Duration, exponential: bool) -> Self {
        Self {
            retries_left,
            interval,
            exponential,
            retries_used: 0,
        }
    }

    /// Check if another retry is available
    pub fn can_retry(&self) -> bool {
        self.retries_left > 0
    }

    /// Consume one retry and return the wait that precedes it.
    ///
    /// Returns `None` once the retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        let delay = self.interval;
        self.retries_left -= 1;
        self.retries_used += 1;
        if self.exponential {
            self.interval = self.interval.saturating_mul(2);
        }

        Some(delay)
    }

    /// Attempts made so far, counting the initial one
    pub fn attempts_made(&self) -> u32 {
        self.retries_used + 1
    }
}

/// Run `operation` with explicit retry parameters.
///
/// Equivalent to `RetryPolicy::new(retries_left, interval_ms, exponential).run(operation)`.
pub async fn retry<T, E, F, Fut>(
    operation: F,
    retries_left: u32,
    interval_ms: u64,
    exponential: bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryPolicy::new(retries_left, Duration::from_millis(interval_ms), exponential)
        .run(operation)
        .await
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
