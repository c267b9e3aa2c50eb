//! Retry policy: exponential backoff with bounded jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `[jobs.retry]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter spread as a fraction of the delay
    pub jitter_ratio: f64,
    /// Lower bound on the jitter spread
    pub jitter_min_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(63) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        scaled.min(self.max_delay_ms as f64).max(0.0) as u64
    }

    /// Jittered delay after the given failed attempt, never above `max_delay_ms`
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }

        let max = self.max_delay_ms as f64;
        let span = ((anchor as f64) * self.jitter_ratio.max(0.0))
            .max(self.jitter_min_ms as f64)
            .min(max);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(max);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        Duration::from_millis(rng.gen_range(lower..=upper).round() as u64)
    }
}
