//! Retry policy for transient starting-phase failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay every attempt.
    Fixed { delay_ms: u64 },
    /// Exponential backoff capped at `max_ms`.
    ExponentialBackoff { base_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    /// Sleep duration before the given retry attempt (0-indexed).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = match self {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::ExponentialBackoff { base_ms, max_ms } => 1u64
                .checked_shl(attempt as u32)
                .and_then(|s| base_ms.checked_mul(s))
                .unwrap_or(*max_ms)
                .min(*max_ms),
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff {
            base_ms: 500,
            max_ms: 10_000,
        }
    }
}

/// How many attempts to make and which [`RetryPolicy`] to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts (1 = no retry).
    pub max_attempts: usize,
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_attempts: usize, base_ms: u64) -> Self {
        Self {
            max_attempts,
            policy: RetryPolicy::ExponentialBackoff {
                base_ms,
                max_ms: base_ms.saturating_mul(32),
            },
        }
    }

    /// No retry at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            policy: RetryPolicy::Fixed { delay_ms: 0 },
        }
    }
}
