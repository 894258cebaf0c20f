//! Retry schedules for the two reconnection layers.
//!
//! - [`TransportRetryPolicy`]: used by the transport while renegotiating a
//!   dropped connection. Two fixed tiers: quick retries for short blips, then a
//!   slower cadence for longer outages.
//! - [`OuterBackoff`]: used by the connection manager when opening the
//!   connection fails. Doubling delay with a ceiling and a hard attempt budget.

use serde::Deserialize;
use std::time::Duration;

/// Two-tier schedule for transport-level reconnects.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TransportRetryPolicy {
    #[serde(default = "default_short_delay_ms")]
    pub short_delay_ms: u64,
    #[serde(default = "default_long_delay_ms")]
    pub long_delay_ms: u64,
    /// Attempts served from the short tier
    #[serde(default = "default_short_attempts")]
    pub short_attempts: u32,
    /// Attempts before the transport gives up
    #[serde(default = "default_transport_max_attempts")]
    pub max_attempts: u32,
}

fn default_short_delay_ms() -> u64 {
    2_000
}

fn default_long_delay_ms() -> u64 {
    10_000
}

fn default_short_attempts() -> u32 {
    3
}

fn default_transport_max_attempts() -> u32 {
    5
}

impl Default for TransportRetryPolicy {
    fn default() -> Self {
        Self {
            short_delay_ms: default_short_delay_ms(),
            long_delay_ms: default_long_delay_ms(),
            short_attempts: default_short_attempts(),
            max_attempts: default_transport_max_attempts(),
        }
    }
}

impl TransportRetryPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let ms = if attempt <= self.short_attempts {
            self.short_delay_ms
        } else {
            self.long_delay_ms
        };
        Some(Duration::from_millis(ms))
    }
}

/// Doubling backoff with a ceiling for failed connection opens.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OuterBackoff {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Failed opens tolerated before reporting terminal failure
    #[serde(default = "default_outer_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_outer_max_attempts() -> u32 {
    5
}

impl Default for OuterBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_outer_max_attempts(),
        }
    }
}

impl OuterBackoff {
    /// Delay after failed attempt `failures` (1-based), or `None` when the
    /// budget is spent and no further attempt should be made.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}
