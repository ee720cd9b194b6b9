use std::time::Duration;

/// Exponential reconnect schedule: the delay after the n-th consecutive
/// failure is `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Zero means unlimited.
    max_attempts: u32,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.failures >= self.max_attempts
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Counts one failure and returns the wait before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }
        Some(self.delay_for(self.failures))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
