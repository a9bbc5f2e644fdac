use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the executor does when a lifecycle call returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop the stream and report the error
    #[default]
    Propagate,

    /// Count the error and finish the stream quietly
    SkipItem,

    /// Emit an errored buffer downstream, then finish the stream
    MarkError,
}

/// Reconnection schedule of a streaming source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never reconnect
    Never,

    /// Reconnect without delay
    Immediate { max_attempts: u32 },

    /// Reconnect after a constant interval
    Fixed { interval_ms: u64, max_attempts: u32 },

    /// Exponential backoff between attempts
    Exponential {
        base_ms: u64,
        max_ms: u64,
        max_attempts: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Fixed {
            interval_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Never => 0,
            Self::Immediate { max_attempts }
            | Self::Fixed { max_attempts, .. }
            | Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before attempt number `attempt`, counted from 1
    pub fn interval(&self, attempt: u32) -> Duration {
        match self {
            Self::Never | Self::Immediate { .. } => Duration::ZERO,
            Self::Fixed { interval_ms, .. } => Duration::from_millis(*interval_ms),
            Self::Exponential { base_ms, max_ms, .. } => {
                let shift = attempt.saturating_sub(1).min(63);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}
