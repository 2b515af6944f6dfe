//! Exponential-backoff retry policy for upstream calls.
//!
//! Transient failures (429, 5xx, timeouts) are retried with binary
//! exponential backoff and jitter; permanent failures propagate on the
//! first attempt.

use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{RagError, Result};

/// Maximum retry attempts.
pub const MAX_ATTEMPTS: u32 = 5;

/// Base delay (1 second).
const BASE_DELAY_MS: u64 = 1_000;

/// Delay cap (30 seconds).
const MAX_DELAY_MS: u64 = 30_000;

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            enable_jitter: true,
        }
    }

    /// Custom attempt count and base delay; the cap stays at 30s.
    pub fn with_config(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: MAX_DELAY_MS,
            enable_jitter: true,
        }
    }

    /// Run `operation`, retrying transient failures until the budget is
    /// exhausted. The last error is returned once attempts run out.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_transient() {
                        return Err(e);
                    }

                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %e, "retry budget exhausted");
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient upstream failure, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Delay before the given (1-indexed) retry attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1));
        let capped = exponential.min(self.max_delay_ms);

        let final_ms = if self.enable_jitter {
            // ±25% jitter
            let jitter = (capped / 4) as i64;
            let offset = (rand::random::<f64>() * 2.0 - 1.0) * jitter as f64;
            ((capped as i64) + offset as i64).max(0) as u64
        } else {
            capped
        };

        Duration::from_millis(final_ms)
    }
}
