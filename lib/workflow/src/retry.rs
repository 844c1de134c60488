//! Retry policies for nodes and try-catch containers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest shift applied by exponential backoff, so delays never overflow.
const MAX_EXPONENT: u32 = 20;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// `delay * retry`.
    Linear,
    /// `delay * 2^(retry - 1)`.
    Exponential,
}

/// How often, and how patiently, a failing unit of work is re-attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Upper bound on a single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryPolicy {
    /// A policy with a fixed delay between attempts.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff: Backoff::Fixed,
            max_delay_ms: None,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Total attempts, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before retry number `retry` (1 for the first retry).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let ms = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(u64::from(retry)),
            Backoff::Exponential => {
                let exponent = (retry - 1).min(MAX_EXPONENT);
                self.delay_ms.saturating_mul(1_u64 << exponent)
            }
        };
        let ms = self.max_delay_ms.map_or(ms, |cap| ms.min(cap));
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    /// A single attempt, no retries.
    fn default() -> Self {
        Self::fixed(1, 0)
    }
}
