use std::time::Duration;

use crate::config::RetryPolicy;

impl RetryPolicy {
    /// Deterministic delay before retry number `failures` (1-based):
    /// `min(max_delay, base_delay * 2^(failures - 1))`.
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Jittered delay: the deterministic delay scaled by a factor drawn
    /// uniformly from `[0.5, 1.5)`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        self.base_delay_for(failures).mul_f64(0.5 + fastrand::f64())
    }

    /// Whether another network attempt is allowed after `failures`
    /// transient failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
