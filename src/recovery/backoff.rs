use crate::config::RecoveryConfig;
use std::time::Duration;

/// Exponential backoff for restart delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Calculate the delay before restart number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        // delay = base * 2^attempt, capped at max
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}
