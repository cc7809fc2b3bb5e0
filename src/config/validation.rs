//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ticks > 0, multiplier >= 2, bounded poll budget)
//! - Check addresses and the backend URL parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::resilience::MAX_BUDGET_SECS;

/// Longest liveness probe the worker tolerates, in milliseconds.
const MAX_LIVENESS_POLL_MS: u64 = 1000;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("queue.liveness_poll_ms must be at most {max}ms, got {actual}ms")]
    PollBudgetTooLarge { max: u64, actual: u64 },

    #[error("timeouts.hard_limit_multiplier must be at least 2, got {0}")]
    MultiplierTooSmall(f64),

    #[error("{field} must be a finite value between 0 and {max}, got {value}")]
    OutOfRange { field: &'static str, value: f64, max: f64 },

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("backend.url is invalid: {0}")]
    InvalidBackendUrl(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive: [(&'static str, u64); 5] = [
        ("queue.tick_ms", config.queue.tick_ms),
        ("queue.liveness_poll_ms", config.queue.liveness_poll_ms),
        ("queue.sweep_interval_ms", config.queue.sweep_interval_ms),
        ("queue.response_buffer", config.queue.response_buffer as u64),
        ("backend.start_attempts", config.backend.start_attempts as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    if config.queue.liveness_poll_ms > MAX_LIVENESS_POLL_MS {
        errors.push(ValidationError::PollBudgetTooLarge {
            max: MAX_LIVENESS_POLL_MS,
            actual: config.queue.liveness_poll_ms,
        });
    }

    if !(config.timeouts.chars_per_second > 0.0) {
        errors.push(ValidationError::NotPositive { field: "timeouts.chars_per_second" });
    } else if !config.timeouts.chars_per_second.is_finite() {
        errors.push(ValidationError::OutOfRange {
            field: "timeouts.chars_per_second",
            value: config.timeouts.chars_per_second,
            max: f64::MAX,
        });
    }

    let base = config.timeouts.base_secs;
    if !(0.0..=MAX_BUDGET_SECS).contains(&base) {
        errors.push(ValidationError::OutOfRange {
            field: "timeouts.base_secs",
            value: base,
            max: MAX_BUDGET_SECS,
        });
    }

    // Also rejects NaN.
    if !(config.timeouts.hard_limit_multiplier >= 2.0) {
        errors.push(ValidationError::MultiplierTooSmall(
            config.timeouts.hard_limit_multiplier,
        ));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    match url::Url::parse(&config.backend.url) {
        Ok(url) if url.scheme() == "http" => {}
        Ok(url) => errors.push(ValidationError::InvalidBackendUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        ))),
        Err(e) => errors.push(ValidationError::InvalidBackendUrl(e.to_string())),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
