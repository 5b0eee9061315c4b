//! Jitter primitives and randomized sleeps.
//!
//! Two independent randomness sources back the SDK's timing decisions:
//!
//! - **Structural jitter** ([`Jitter`]): a per-process RNG seeded from the
//!   host name and process id. The same process always produces the same
//!   multiplier sequence (reproducible for debugging), while independent
//!   processes sharing a server quota drift apart instead of oscillating
//!   in lock-step.
//! - **Ephemeral jitter** ([`sleep_with_jitter`], [`additive_jitter`]): a
//!   freely seeded thread-local RNG used for backoff and poll sleeps, so
//!   retries from concurrent calls do not collide.
//!
//! All sleeps in the SDK go through `tokio::time`, which keeps them on the
//! monotonic clock and controllable from tests.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};

/// Multiplicative jitter generator: values drawn from `[1-factor, 1+factor]`.
#[derive(Debug)]
pub struct Jitter {
    factor: f64,
    rng: Mutex<StdRng>,
}

impl Jitter {
    /// Create a jitter source with a deterministic per-process seed.
    ///
    /// The seed hashes `(hostname, pid)`: the same process reproduces the
    /// same sequence, different processes get different sequences.
    pub fn structural(factor: f64) -> Self {
        assert!((0.0..1.0).contains(&factor), "jitter factor must be in [0, 1)");
        Self {
            factor,
            rng: Mutex::new(StdRng::seed_from_u64(process_seed())),
        }
    }

    /// Create a jitter source from an explicit RNG.
    ///
    /// Intended for tests that need a reproducible sequence independent of
    /// the host identity.
    pub fn from_rng(factor: f64, rng: StdRng) -> Self {
        assert!((0.0..1.0).contains(&factor), "jitter factor must be in [0, 1)");
        Self {
            factor,
            rng: Mutex::new(rng),
        }
    }

    /// A jitter source that always yields exactly `1.0`.
    pub fn constant() -> Self {
        Self {
            factor: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Draw the next multiplier in `[1-factor, 1+factor]`.
    pub fn next(&self) -> f64 {
        if self.factor == 0.0 {
            return 1.0;
        }
        let mut rng = self.rng.lock().expect("jitter rng lock poisoned");
        rng.gen_range(1.0 - self.factor..=1.0 + self.factor)
    }

    /// Multiply `value` by a fresh jitter multiplier.
    pub fn apply(&self, value: f64) -> f64 {
        value * self.next()
    }

    /// The configured jitter factor.
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

/// Hash of `(hostname, pid)` used to seed structural jitter.
fn process_seed() -> u64 {
    let mut hasher = DefaultHasher::new();
    hostname().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    hasher.finish()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Sleep for `duration` varied by up to `±factor` (multiplicative).
///
/// Used between polls and while waiting for rate-limit tokens, so
/// concurrent workers spread out instead of waking simultaneously.
pub async fn sleep_with_jitter(duration: Duration, factor: f64) {
    let jitter = thread_rng().gen_range(-factor..=factor);
    let jittered = (duration.as_secs_f64() * (1.0 + jitter)).max(0.0);
    tokio::time::sleep(Duration::from_secs_f64(jittered)).await;
}

/// Stretch `base` by a uniform additive fraction in `[0, max_fraction]`.
///
/// This is the backoff-sleep shape: attempts never wait less than the
/// exponential base, only up to `max_fraction` longer.
pub fn additive_jitter(base: Duration, max_fraction: f64) -> Duration {
    let stretch = thread_rng().gen_range(0.0..=max_fraction);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + stretch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_reproduces_sequence() {
        let a = Jitter::from_rng(0.2, StdRng::seed_from_u64(42));
        let b = Jitter::from_rng(0.2, StdRng::seed_from_u64(42));
        let seq_a: Vec<f64> = (0..16).map(|_| a.next()).collect();
        let seq_b: Vec<f64> = (0..16).map(|_| b.next()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_different_seeds_diverge() {
        let a = Jitter::from_rng(0.2, StdRng::seed_from_u64(1));
        let b = Jitter::from_rng(0.2, StdRng::seed_from_u64(2));
        let seq_a: Vec<f64> = (0..16).map(|_| a.next()).collect();
        let seq_b: Vec<f64> = (0..16).map(|_| b.next()).collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn test_multiplier_stays_in_range() {
        let jitter = Jitter::structural(0.2);
        for _ in 0..1000 {
            let value = jitter.next();
            assert!((0.8..=1.2).contains(&value), "out of range: {value}");
        }
    }

    #[test]
    fn test_constant_jitter_is_identity() {
        let jitter = Jitter::constant();
        for _ in 0..10 {
            assert_eq!(jitter.apply(60.0), 60.0);
        }
    }

    #[test]
    fn test_additive_jitter_never_shrinks() {
        let base = Duration::from_millis(500);
        for _ in 0..1000 {
            let stretched = additive_jitter(base, 0.3);
            assert!(stretched >= base);
            assert!(stretched <= Duration::from_secs_f64(0.5 * 1.3 + f64::EPSILON));
        }
    }
}
