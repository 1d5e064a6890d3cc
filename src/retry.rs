//! Retry with exponential backoff.
//!
//! [`RetryPolicy`] is the single backoff rule used across the archiver:
//!
//! - transient fetch and upload failures ([`RetryPolicy::transient`]), with jitter
//! - eventual-consistency polling of the metadata endpoint
//!   ([`RetryPolicy::verification`]), without jitter so delays are exactly
//!   `1s, 2s, 4s, ...`
//!
//! # Backoff Strategy
//!
//! ```text
//! delay(n) = min(base_delay * 2^n, max_delay) + random_jitter(0..250ms)
//! ```
//!
//! where `n` is the zero-based attempt index.

use crate::error::{ArchiveError, Result};
use rand::{Rng, rng};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, warn};

const MAX_JITTER_MS: u64 = 250;

/// `(max_attempts, base_delay, backoff)` applied uniformly to remote operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Add up to 250ms of random jitter to each delay.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy for transient network failures: `retries` retries after the first attempt.
    pub fn transient(retries: u32) -> Self {
        Self {
            max_attempts: retries + 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// Policy for verification polling: `attempts` lookups at `2^0, 2^1, ...` seconds.
    pub fn verification(attempts: u32) -> Self {
        let ceiling = 1u64 << attempts.saturating_sub(1).min(16);
        Self {
            max_attempts: attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(ceiling),
            jitter: false,
        }
    }

    /// Backoff for the zero-based attempt index `n`, before jitter.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// The full schedule of delays, one per attempt.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay + Duration::from_millis(rng().random_range(0..=MAX_JITTER_MS))
        } else {
            delay
        }
    }

    /// Run `op`, retrying transient failures until the attempts are exhausted.
    ///
    /// Non-transient errors are returned immediately. The last transient
    /// error is returned once the policy gives up.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        error!(
                            operation,
                            attempt,
                            max = self.max_attempts,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.jittered(self.delay_for(attempt - 1));
                    warn!(
                        operation,
                        attempt,
                        max = self.max_attempts,
                        ?delay,
                        error = %e,
                        "Attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Poll `probe` until it reports `true`, sleeping the scheduled delay
    /// before each attempt. Returns `false` once the attempts run out.
    ///
    /// Errors from the probe count as a negative answer for that attempt.
    pub async fn poll<F, Fut>(&self, operation: &str, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ArchiveError>>,
    {
        for n in 0..self.max_attempts {
            let delay = self.jittered(self.delay_for(n));
            sleep(delay).await;
            match probe().await {
                Ok(true) => return true,
                Ok(false) => {
                    warn!(operation, attempt = n + 1, max = self.max_attempts, ?delay, "Not visible yet");
                }
                Err(e) => {
                    warn!(operation, attempt = n + 1, max = self.max_attempts, error = %e, "Probe failed");
                }
            }
        }
        false
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient(crate::config::DEFAULT_FETCH_RETRIES)
    }
}
