//! Capped exponential backoff for remote operations.
//!
//! Retries are driven by [`crate::Error::is_retryable`]: connection failures,
//! timeouts, HTTP 5xx and HTTP 429 are retried, everything else (security
//! violations included) returns on the first failure.

use crate::constants::{RETRY_INITIAL_DELAY, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY, RETRY_MULTIPLIER};
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff calculator.
///
/// The delay is multiplied after each call to [`Backoff::next_delay`],
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of delays handed out since the last reset.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY, RETRY_MULTIPLIER)
    }
}

/// Bounds and pacing for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            initial_delay: RETRY_INITIAL_DELAY,
            max_delay: RETRY_MAX_DELAY,
            multiplier: RETRY_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay, self.multiplier)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt bound is reached. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
