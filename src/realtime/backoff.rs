use std::time::Duration;

use tracing::trace;

/// Exponential reconnect backoff with an attempt ceiling.
///
/// The first failure waits `base_delay`, every further consecutive failure
/// doubles it up to `max_delay`. Once `max_attempts` consecutive failures
/// have been counted, [`Backoff::exhausted`] turns true.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    config: Config,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 6,
        }
    }
}

impl Backoff {
    pub fn new(config: Config) -> Self {
        Self {
            failures: 0,
            config,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn increment(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.failures >= self.config.max_attempts
    }

    /// Delay before the next attempt. Zero before any failure.
    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(self.failures - 1);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    pub async fn sleep(&self) {
        let delay = self.delay();
        if delay.is_zero() {
            return;
        }

        trace!("backoff {} ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}
