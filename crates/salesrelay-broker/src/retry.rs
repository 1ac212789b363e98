//! Reconnect policy for broker operations.
//!
//! Fixed interval by default; a multiplier > 1.0 turns it into capped
//! exponential backoff.

use std::time::Duration;

use salesrelay_core::config::BrokerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    pub interval: Duration,
    /// Retries allowed after the initial attempt (0 = try once).
    pub max_retries: u32,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 5)
    }
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            multiplier: 1.0,
            max_interval: interval,
        }
    }

    pub fn exponential(interval: Duration, max_retries: u32, max_interval: Duration) -> Self {
        Self {
            interval,
            max_retries,
            multiplier: 2.0,
            max_interval,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::fixed(config.reconnect_interval(), config.max_reconnect_attempts)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts <= self.max_retries
    }

    /// Delay before the retry that follows failure number `failed_attempts` (1-indexed).
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(failed_attempts as i32 - 1);
        let delay = self.interval.as_secs_f64() * factor;
        let cap = self.max_interval.max(self.interval).as_secs_f64();
        Duration::from_secs_f64(delay.min(cap))
    }

    /// Upper bound on the total time spent waiting between attempts.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_retries).map(|n| self.delay_for_attempt(n)).sum()
    }
}
