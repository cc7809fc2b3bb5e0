//! Timeout policy calculation.
//!
//! # Responsibilities
//! - Derive the time-to-first-byte budget from request size and the configured floor
//! - Derive the silence budget from the TTFB budget and the silence floor
//! - Derive the hard limit that no amount of snoozing may exceed
//!
//! # Design Decisions
//! - Pure function of numeric inputs; computed once per request at dequeue
//! - Inputs are clamped to finite, non-negative values and budgets to `MAX_BUDGET_SECS`
//! - The hard limit scales the larger budget so it always dominates both

use std::time::Duration;

use crate::config::TimeoutConfig;

/// Ceiling for every budget, in seconds (30 days).
pub const MAX_BUDGET_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// Baselines and floors the policy is computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySettings {
    /// Fixed part of the TTFB budget in seconds.
    pub base_secs: f64,
    /// Request characters that add one second of TTFB budget.
    pub chars_per_second: f64,
    /// Minimum TTFB budget in milliseconds.
    pub min_completion_timeout_ms: u64,
    /// Minimum silence budget in milliseconds.
    pub min_silence_threshold_ms: u64,
    /// Hard limit multiple.
    pub hard_limit_multiplier: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for PolicySettings {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            base_secs: config.base_secs,
            chars_per_second: config.chars_per_second,
            min_completion_timeout_ms: config.min_completion_timeout_ms,
            min_silence_threshold_ms: config.min_silence_threshold_ms,
            hard_limit_multiplier: config.hard_limit_multiplier,
        }
    }
}

/// Per-request timeout budgets, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub ttfb_budget: f64,
    pub silence_budget: f64,
    pub hard_limit: f64,
}

impl TimeoutPolicy {
    /// Compute the policy for a request of `request_size_chars` characters.
    pub fn compute(request_size_chars: usize, settings: &PolicySettings) -> Self {
        let base = non_negative(settings.base_secs);
        // A zero divisor would make the size term infinite; treat it as "size is free".
        let size_secs = if settings.chars_per_second > 0.0 && settings.chars_per_second.is_finite() {
            request_size_chars as f64 / settings.chars_per_second
        } else {
            0.0
        };
        let ttfb_floor = settings.min_completion_timeout_ms as f64 / 1000.0;
        let ttfb_budget = (base + size_secs).max(ttfb_floor).min(MAX_BUDGET_SECS);

        let silence_floor = settings.min_silence_threshold_ms as f64 / 1000.0;
        let silence_budget = silence_floor.max(ttfb_budget / 2.0).min(MAX_BUDGET_SECS);

        // Both budgets sit under the ceiling, so the capped hard limit still dominates them.
        let multiplier = non_negative(settings.hard_limit_multiplier).max(2.0);
        let hard_limit = (ttfb_budget.max(silence_budget) * multiplier).min(MAX_BUDGET_SECS);

        Self {
            ttfb_budget,
            silence_budget,
            hard_limit,
        }
    }

    /// Budget applied once content has started flowing.
    pub fn streaming_budget(&self) -> f64 {
        self.silence_budget.max(self.ttfb_budget)
    }

    pub fn ttfb(&self) -> Duration {
        saturating_secs(self.ttfb_budget)
    }

    pub fn streaming(&self) -> Duration {
        saturating_secs(self.streaming_budget())
    }

    pub fn hard(&self) -> Duration {
        saturating_secs(self.hard_limit)
    }
}

/// Convert seconds to a `Duration` without panicking on out-of-range input.
pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
