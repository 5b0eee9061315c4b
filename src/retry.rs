//! Retry engine with jittered exponential backoff.
//!
//! [`RetryPolicy::run`] wraps any fallible async operation. Errors are
//! classified through [`Error::is_retryable`]; retryable failures back off
//! exponentially (honoring sane `Retry-After` hints) before the next
//! attempt, everything else propagates immediately.
//!
//! The engine sits *outside* the rate-limit decorators: an
//! [`Error::ServerThrottle`] raised by the adaptive limiter has already
//! had its AIMD penalty applied by the time backoff is computed here.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use crate::jitter::additive_jitter;
use crate::transport::MAX_RETRY_AFTER_SECS;
use crate::{Error, Result};

/// Backoff sleeps stretch by up to this additive fraction.
const BACKOFF_JITTER_MAX_FRACTION: f64 = 0.3;

/// Metadata about the current attempt, handed to the operation.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Total attempts this policy will make (`max_retries + 1`).
    pub max_attempts: u32,
    /// Time spent in the retry loop so far, sleeps included.
    pub elapsed: Duration,
    /// Kind of the error that triggered this retry, if any.
    pub last_error_kind: Option<&'static str>,
    /// The backoff slept before this attempt, if any.
    pub suggested_delay: Option<Duration>,
}

impl RetryContext {
    /// Whether a failure of this attempt would exhaust the policy.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Exponential-backoff retry policy.
///
/// Delay before attempt `n` (1-indexed) is
/// `initial_delay * 2^(n-1)`, raised to a `Retry-After` hint when the
/// failing error carries one (hints above 60s are ignored), then
/// stretched by 0–30% ephemeral jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget. `0` disables retry: a single attempt whose error
    /// propagates unwrapped.
    pub max_retries: u32,
    /// Base for the exponential backoff.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Run `op`, re-invoking it on retryable failures until it succeeds,
    /// a non-retryable error occurs, or the budget is exhausted
    /// (→ [`Error::RetriesExhausted`] wrapping the last error).
    ///
    /// The engine keeps no state between calls and is safe to share.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_retries + 1;
        let mut last_error_kind = None;
        let mut suggested_delay = None;

        for attempt in 1..=max_attempts {
            let context = RetryContext {
                attempt,
                max_attempts,
                elapsed: started.elapsed(),
                last_error_kind,
                suggested_delay,
            };

            let err = match op(context).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if self.max_retries == 0 {
                // Retry disabled: surface the original error, not a wrapper.
                return Err(err);
            }
            if attempt == max_attempts {
                error!(
                    "Max retries ({}) exceeded. Last error: {err}",
                    self.max_retries
                );
                return Err(Error::RetriesExhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff_delay(attempt, err.retry_after());
            warn!("Attempt {attempt}/{max_attempts} failed: {err}");
            warn!("Retrying in {:.1}s...", delay.as_secs_f64());
            last_error_kind = Some(err.kind());
            suggested_delay = Some(delay);
            tokio::time::sleep(delay).await;
        }

        unreachable!("retry loop always returns")
    }

    /// Backoff before the attempt following failed attempt `n` (1-indexed).
    fn backoff_delay(&self, failed_attempt: u32, retry_after: Option<f64>) -> Duration {
        let mut base = self.initial_delay.as_secs_f64() * 2f64.powi(failed_attempt as i32 - 1);
        if let Some(hint) = retry_after {
            if hint <= MAX_RETRY_AFTER_SECS {
                base = base.max(hint);
            }
        }
        additive_jitter(Duration::from_secs_f64(base), BACKOFF_JITTER_MAX_FRACTION)
    }
}
