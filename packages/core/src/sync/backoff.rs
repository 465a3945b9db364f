//! Retry scheduling for failed submissions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Exponential backoff: `min(base * 2^retry_count, cap)`, optionally
/// shortened by a random fraction so retries from many records spread out.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.0,
        }
    }

    /// Jitter ratio in `[0, 1]`. A ratio of 0.2 means a delay may be cut by
    /// up to 20%.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before the next attempt of a record that has already failed
    /// `retry_count` times (not counting the failure being scheduled).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn jittered_delay(&self, retry_count: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.delay_for(retry_count);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let cut = rng.gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 - cut)
    }

    /// Wall-clock time at which the record becomes eligible again.
    pub fn next_attempt_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.jittered_delay(retry_count, &mut rand::thread_rng());
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now)
    }
}
