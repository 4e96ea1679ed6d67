//! Exponential backoff with jitter for mutation retries

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry
    pub base: Duration,
    /// Cap of the exponential part
    pub cap: Duration,
    /// Exclusive upper bound of the added jitter
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl Backoff {
    /// Take the backoff settings of a client config
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: config.backoff_base,
            cap: config.backoff_cap,
            jitter: config.backoff_jitter,
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt` (0-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Full delay: `min(base * 2^attempt, cap) + uniform[0, jitter)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }
}
