//! Protocol tuning knobs.
//!
//! Every interval and threshold of the lock protocol lives in [`Tuning`] so
//! tests can shrink them to milliseconds while the CLI ships the defaults.
//! Unknown fields are ignored when deserializing for forward compatibility.

use crate::error::{Result, TurnstileError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning values for the lock protocol.
///
/// The defaults encode the protocol contract: a spot record is considered
/// abandoned after `spot_lifetime_secs`, the acquisition loop ticks every
/// `acquire_tick_ms`, and a caller stuck holding a partial set of lines for
/// `stall_threshold` ticks goes to the back of every line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Seconds after which an unrefreshed spot record may be reaped by anyone.
    pub spot_lifetime_secs: i64,

    /// Acquisition loop tick interval in milliseconds.
    pub acquire_tick_ms: u64,

    /// Bounded wait for each whole-file exclusive hold attempt, milliseconds.
    pub hold_timeout_ms: u64,

    /// Number of partially-stalled ticks before every reservation re-queues.
    pub stall_threshold: u32,

    /// Interval between background spot refreshes, milliseconds.
    pub refresh_interval_ms: u64,

    /// Poll interval for the unlockfile wait mode, milliseconds.
    pub unlock_poll_ms: u64,

    /// Poll interval for the parent-process watchdog, milliseconds.
    pub watchdog_poll_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            spot_lifetime_secs: 60,
            acquire_tick_ms: 100,
            hold_timeout_ms: 50,
            stall_threshold: 300,
            refresh_interval_ms: 2000,
            unlock_poll_ms: 50,
            watchdog_poll_ms: 200,
        }
    }
}

impl Tuning {
    /// Validate tuning values and return an error on invalid ones.
    pub fn validate(&self) -> Result<()> {
        if self.spot_lifetime_secs <= 0 {
            return Err(TurnstileError::Usage(
                "tuning validation failed: spot_lifetime_secs must be greater than 0".to_string(),
            ));
        }

        if self.acquire_tick_ms == 0 || self.refresh_interval_ms == 0 {
            return Err(TurnstileError::Usage(
                "tuning validation failed: intervals must be greater than 0".to_string(),
            ));
        }

        if self.unlock_poll_ms == 0 || self.watchdog_poll_ms == 0 {
            return Err(TurnstileError::Usage(
                "tuning validation failed: poll intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn acquire_tick(&self) -> Duration {
        Duration::from_millis(self.acquire_tick_ms)
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_millis(self.hold_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn unlock_poll(&self) -> Duration {
        Duration::from_millis(self.unlock_poll_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }
}

#[cfg(test)]
impl Tuning {
    /// Tuning shrunk for tests: everything converges within a few hundred
    /// milliseconds instead of tens of seconds.
    pub(crate) fn fast() -> Self {
        Self {
            spot_lifetime_secs: 60,
            acquire_tick_ms: 10,
            hold_timeout_ms: 20,
            stall_threshold: 30,
            refresh_interval_ms: 100,
            unlock_poll_ms: 10,
            watchdog_poll_ms: 20,
        }
    }
}
