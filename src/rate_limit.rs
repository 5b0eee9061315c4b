//! Client-side rate limiting decorators.
//!
//! Both decorators wrap an inner [`HttpTransport`] and throttle only
//! work-creating requests (POST). Polling reads (GET) pass through
//! untouched: a single job may poll an unbounded number of times, so
//! counting polls against the submission quota would starve it.
//!
//! - [`TokenBucketTransport`]: fixed-rate token bucket.
//! - [`AdaptiveTransport`]: token bucket whose capacity follows an AIMD
//!   feedback law driven by server responses (additive recovery on 2xx,
//!   multiplicative penalty on HTTP 429), with structural jitter so
//!   independent processes sharing a quota drift apart instead of
//!   oscillating in lock-step.
//!
//! A token represents one submission against the shared server quota.
//! State lives behind a mutex with O(1) critical sections; waits happen
//! outside the lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::jitter::{sleep_with_jitter, Jitter};
use crate::transport::{HttpTransport, TransportResponse};
use crate::{Error, Result};

/// Structural jitter applied to AIMD factors and token-wait sleeps (±20%).
const JITTER_FACTOR: f64 = 0.20;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Current capacity; constant for the plain token bucket, mutable
    /// under AIMD for the adaptive variant.
    effective_max: f64,
}

impl BucketState {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            effective_max: capacity,
        }
    }

    /// Refill from elapsed time, then either take a token or report how
    /// long until one is available.
    fn try_acquire(&mut self, time_window: Duration) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill_rate = self.effective_max / time_window.as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(self.effective_max);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / refill_rate))
    }
}

fn check_wait_budget(
    start: Instant,
    pending_wait: Duration,
    max_wait_time: Option<Duration>,
) -> Result<()> {
    if let Some(max_wait) = max_wait_time {
        let waited = start.elapsed();
        if waited + pending_wait > max_wait {
            return Err(Error::ThrottleTimeout {
                waited: waited.as_secs_f64(),
                max_wait: max_wait.as_secs_f64(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Token bucket
// =============================================================================

/// Fixed-rate throttling decorator.
///
/// Allows `max_requests` POSTs per `time_window`, blocking callers while
/// the bucket is empty. Waiting longer than `max_wait_time` fails with
/// [`Error::ThrottleTimeout`], a retryable error like the throttling
/// failures of the server itself.
pub struct TokenBucketTransport {
    inner: Arc<dyn HttpTransport>,
    time_window: Duration,
    max_wait_time: Option<Duration>,
    state: Mutex<BucketState>,
}

impl TokenBucketTransport {
    pub fn new(
        inner: Arc<dyn HttpTransport>,
        max_requests: u32,
        time_window: Duration,
        max_wait_time: Option<Duration>,
    ) -> Self {
        assert!(max_requests > 0, "max_requests must be greater than 0");
        assert!(!time_window.is_zero(), "time_window must be greater than 0");
        Self {
            inner,
            time_window,
            max_wait_time,
            state: Mutex::new(BucketState::new(max_requests as f64)),
        }
    }

    async fn acquire_token(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().expect("token bucket lock poisoned");
                match state.try_acquire(self.time_window) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            check_wait_budget(start, wait, self.max_wait_time)?;
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.state.lock().unwrap().tokens
    }
}

#[async_trait]
impl HttpTransport for TokenBucketTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.inner.get(url, headers, timeout).await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.acquire_token().await?;
        self.inner.post(url, body, timeout).await
    }
}

// =============================================================================
// Adaptive (AIMD)
// =============================================================================

/// Feedback-driven throttling decorator.
///
/// Starts optimistically at the full configured rate; an HTTP 429 is the
/// only signal that lowers it. On 429 the effective rate shrinks
/// multiplicatively (never below the floor) and the call fails with
/// [`Error::ServerThrottle`], leaving the retry wait to the retry engine.
/// Successful POSTs recover the rate additively up to the ceiling.
///
/// Both AIMD factors are perturbed by per-process structural jitter:
/// without it, processes sharing a quota penalize and recover in
/// lock-step and keep tripping the limit together.
pub struct AdaptiveTransport {
    inner: Arc<dyn HttpTransport>,
    max_requests: u32,
    time_window: Duration,
    min_rate_floor: f64,
    penalty_factor: f64,
    recovery_factor: f64,
    max_wait_time: Option<Duration>,
    jitter: Jitter,
    state: Mutex<BucketState>,
}

impl AdaptiveTransport {
    pub fn new(inner: Arc<dyn HttpTransport>, max_requests: u32, time_window: Duration) -> Self {
        assert!(max_requests > 0, "max_requests must be greater than 0");
        assert!(!time_window.is_zero(), "time_window must be greater than 0");
        Self {
            inner,
            max_requests,
            time_window,
            min_rate_floor: 0.1,
            penalty_factor: 0.3,
            recovery_factor: 0.05,
            max_wait_time: Some(Duration::from_secs(45)),
            jitter: Jitter::structural(JITTER_FACTOR),
            state: Mutex::new(BucketState::new(max_requests as f64)),
        }
    }

    pub fn with_min_rate_floor(mut self, min_rate_floor: f64) -> Self {
        assert!(
            min_rate_floor > 0.0 && min_rate_floor <= 1.0,
            "min_rate_floor must be between 0 (exclusive) and 1 (inclusive)"
        );
        self.min_rate_floor = min_rate_floor;
        self
    }

    pub fn with_penalty_factor(mut self, penalty_factor: f64) -> Self {
        assert!(
            penalty_factor > 0.0 && penalty_factor < 1.0,
            "penalty_factor must be between 0 and 1 (exclusive)"
        );
        self.penalty_factor = penalty_factor;
        self
    }

    pub fn with_recovery_factor(mut self, recovery_factor: f64) -> Self {
        assert!(
            recovery_factor > 0.0 && recovery_factor < 1.0,
            "recovery_factor must be between 0 and 1 (exclusive)"
        );
        self.recovery_factor = recovery_factor;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Option<Duration>) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    /// Replace the structural jitter source (deterministic tests).
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Current effective rate (requests per `time_window`).
    pub fn effective_rate(&self) -> f64 {
        self.state.lock().expect("adaptive limiter lock poisoned").effective_max
    }

    fn min_effective(&self) -> f64 {
        self.max_requests as f64 * self.min_rate_floor
    }

    async fn acquire_token(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().expect("adaptive limiter lock poisoned");
                match state.try_acquire(self.time_window) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            check_wait_budget(start, wait, self.max_wait_time)?;
            // Jittered so concurrent waiters spread out on wake-up.
            sleep_with_jitter(wait, JITTER_FACTOR).await;
        }
    }

    /// Additive increase after a successful work-creating call.
    fn on_success(&self) {
        let mut state = self.state.lock().expect("adaptive limiter lock poisoned");
        let recovery = self.max_requests as f64 * self.recovery_factor * self.jitter.next();
        state.effective_max = (state.effective_max + recovery).min(self.max_requests as f64);
    }

    /// Multiplicative decrease after HTTP 429.
    fn on_rate_limited(&self) {
        let mut state = self.state.lock().expect("adaptive limiter lock poisoned");
        let penalty = self.penalty_factor * self.jitter.next();
        let old = state.effective_max;
        state.effective_max = (state.effective_max * (1.0 - penalty)).max(self.min_effective());
        // Tokens above the shrunk capacity would break the bucket invariant.
        state.tokens = state.tokens.min(state.effective_max);
        warn!(
            "Rate limited: effective_max reduced from {:.1} to {:.1}",
            old, state.effective_max
        );
    }
}

#[async_trait]
impl HttpTransport for AdaptiveTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.inner.get(url, headers, timeout).await
    }

    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.acquire_token().await?;
        let response = self.inner.post(url, body, timeout).await?;

        if response.status == 429 {
            self.on_rate_limited();
            let retry_after = response.retry_after();
            let preview: String = response.text().chars().take(200).collect();
            return Err(Error::ServerThrottle {
                retry_after,
                message: preview,
            });
        }
        if response.is_success() {
            self.on_success();
        }
        // Other statuses carry no throttling signal; leave the rate alone.
        Ok(response)
    }
}
