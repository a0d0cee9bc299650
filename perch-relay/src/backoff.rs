//! Exponential backoff with a cap and deterministic jitter.
//!
//! The attempt counter is plain state on the struct so backoff progress is
//! inspectable from the scheduler and trivially unit-testable without time.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            cap,
            attempt: 0,
        }
    }

    /// Consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Clear the counter after a successful cycle.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry: `base * 2^attempt`, capped, with ±25%
    /// jitter derived from the attempt number so delays stay reproducible
    /// in tests while still de-synchronising sources at runtime.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempt.min(20)).unwrap_or(u32::MAX))
            .min(self.cap);

        let jitter_range = exp.as_millis() as f64 * 0.25;
        let jitter_offset =
            (f64::from(self.attempt) * 7.0 % jitter_range.max(1.0)) - (jitter_range / 2.0);
        let jittered_ms = (exp.as_millis() as f64 + jitter_offset).max(1.0);

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered_ms as u64)
    }
}
