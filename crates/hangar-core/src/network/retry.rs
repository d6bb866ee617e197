//! Backoff for transient transfer failures.
//!
//! Retries apply to a single download candidate only. Permanent failures
//! (a 404, a checksum mismatch) and cancellation surface immediately so
//! the caller can advance to its next candidate instead of hammering a
//! source that will never deliver.

use crate::cancel::CancellationToken;
use crate::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff: the delay doubles after each failed
/// attempt up to a cap, with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt budget, including the first try.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let capped = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Factor in [0.5, 1.5) keeps the average delay unchanged while
        // spreading out simultaneous retries
        let factor = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(capped.as_secs_f64() * factor).min(self.max_delay)
    }
}

/// Drive `operation` until it succeeds, fails permanently, or exhausts the
/// attempt budget.
///
/// Retryability comes from [`crate::HangarError::is_retryable`]; a
/// cancelled token stops further attempts and returns the last error
/// untouched, leaving the cancellation itself to the caller's own checks.
pub async fn with_retries<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let budget = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Succeeded on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() || token.is_cancelled() || attempt >= budget {
            return Err(err);
        }

        let delay = policy.delay_after(attempt);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt, budget, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}
