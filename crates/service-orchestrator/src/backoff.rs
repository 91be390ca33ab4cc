//! Restart budget and delay computation for [`RestartPolicy`].

use crate::descriptor::RestartPolicy;
use rand::Rng;
use std::time::Duration;

impl RestartPolicy {
    /// Whether another start may follow `attempts` failed ones. The first
    /// start is not a retry, so a service gets `max_retries + 1` starts.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before the restart that follows failed attempt `attempt`
    /// (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_base.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.backoff_cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.backoff_cap;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// [`base_delay`](Self::base_delay) plus up to `jitter` of itself, drawn
    /// uniformly.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(factor)
    }
}
