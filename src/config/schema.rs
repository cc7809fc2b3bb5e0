//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Queue and worker tuning.
    pub queue: QueueConfig,

    /// Timeout policy baselines and floors.
    pub timeouts: TimeoutConfig,

    /// Upstream generator settings.
    pub backend: BackendConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2048").
    pub bind_address: String,

    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2048".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Queue worker and sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interval between disconnect sweeps in milliseconds.
    pub sweep_interval_ms: u64,

    /// Upper bound on a single liveness probe in milliseconds.
    pub liveness_poll_ms: u64,

    /// Raw source poll granularity in milliseconds.
    pub tick_ms: u64,

    /// Capacity of each caller's response channel, one slot of which is held for the final event.
    pub response_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 3000,
            liveness_poll_ms: 10,
            tick_ms: 100,
            response_buffer: 256,
        }
    }
}

/// Timeout policy configuration.
///
/// `min_completion_timeout_ms` and `min_silence_threshold_ms` are the two
/// externally tuned floors; the rest are baselines of the policy formula.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Floor for the time-to-first-byte budget in milliseconds.
    pub min_completion_timeout_ms: u64,

    /// Floor for the silence budget in milliseconds.
    pub min_silence_threshold_ms: u64,

    /// Fixed part of the time-to-first-byte budget in seconds.
    pub base_secs: f64,

    /// Request characters that add one second to the budget.
    pub chars_per_second: f64,

    /// Hard limit as a multiple of the larger budget.
    pub hard_limit_multiplier: f64,

    /// Consecutive snoozes granted before only the hard limit applies.
    pub max_consecutive_snoozes: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min_completion_timeout_ms: 300_000,
            min_silence_threshold_ms: 60_000,
            base_secs: 5.0,
            chars_per_second: 1000.0,
            hard_limit_multiplier: 3.0,
            max_consecutive_snoozes: 8,
        }
    }
}

/// Upstream generator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the generator (e.g., "http://127.0.0.1:9222").
    pub url: String,

    /// Timeout for establishing a generation stream in seconds.
    pub connect_timeout_secs: u64,

    /// Timeout for model switch and parameter calls in seconds.
    pub control_timeout_secs: u64,

    /// Attempts to open a generation stream before giving up.
    pub start_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Model used when a request does not name one.
    pub default_model: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9222".to_string(),
            connect_timeout_secs: 10,
            control_timeout_secs: 30,
            start_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2000,
            default_model: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
