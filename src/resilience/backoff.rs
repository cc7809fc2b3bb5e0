//! Jittered exponential backoff between attempts to open a generation stream.

use std::time::Duration;

use rand::Rng;

use crate::config::BackendConfig;

/// Delay schedule for stream-open retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBackoff {
    base_ms: u64,
    max_ms: u64,
}

impl StartBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_delay_ms)
    }

    /// Delay before retry number `retry` (1-based). Retry 0 never waits.
    ///
    /// Up to a tenth of the capped delay is added as jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let capped = self
            .base_ms
            .saturating_mul(1u64 << exponent.min(32))
            .min(self.max_ms);
        let spread = capped / 10;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..spread)
        };
        Duration::from_millis(capped + jitter)
    }
}
