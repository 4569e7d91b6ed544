//! Redelivery policy for transiently failed messages.
//!
//! Exponential backoff: the delay doubles with every failed delivery, from
//! `base` up to `max`.

use std::time::Duration;

use labvm_core::config::{ConfigError, QueueConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Delay after the first failed delivery.
    pub base: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Dead-letter a message after this many failed deliveries.
    pub max_deliveries: Option<u32>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_deliveries: None,
        }
    }
}

impl RedeliveryPolicy {
    pub fn from_config(config: &QueueConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base: config.redelivery_base()?,
            max: config.redelivery_max()?,
            max_deliveries: config.max_deliveries,
        })
    }

    /// Delay before redelivering a message that has failed `failures` times.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << doublings).min(self.max)
    }

    /// Whether a message with `failures` failed deliveries is out of attempts.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_deliveries.is_some_and(|max| failures >= max)
    }
}
