//! Exponential backoff with bounded positive jitter for restart delays.
//!
//! `delay = min(cap, base * 2^(attempt-1) * (1 + random(0, jitter_ratio)))`,
//! clamped so a sequence never shrinks until [`Backoff::reset`].

use std::time::Duration;

use crate::config::BackoffSettings;

const MIN_BASE: Duration = Duration::from_millis(1);

/// Backoff calculator for one plugin.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
    /// Delays handed out since the last reset.
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        let base = settings.base.max(MIN_BASE);
        Self {
            base,
            max: settings.max.max(base),
            jitter_ratio: settings.jitter_ratio.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Compute the next delay and advance the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(31);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let exp = self.base.saturating_mul(factor).min(self.max);

        let jitter = if self.jitter_ratio > 0.0 {
            exp.mul_f64(fastrand::f64() * self.jitter_ratio)
        } else {
            Duration::ZERO
        };

        let delay = exp.saturating_add(jitter).min(self.max).max(self.last).max(self.base);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Forget previous attempts after a healthy probe or a manual start.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
