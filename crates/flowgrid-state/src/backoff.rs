//! Bounded exponential backoff for transient store errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StateResult;

/// Retry schedule: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Run once, never retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> StateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StateResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(operation = what, attempt, ?delay, error = %e, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
