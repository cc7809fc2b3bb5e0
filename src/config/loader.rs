//! Configuration loading from disk and environment.

use std::path::Path;
use std::fs;
use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Overrides the TTFB floor (milliseconds).
pub const ENV_MIN_COMPLETION_TIMEOUT_MS: &str = "GATEWAY_MIN_COMPLETION_TIMEOUT_MS";
/// Overrides the silence floor (milliseconds).
pub const ENV_MIN_SILENCE_THRESHOLD_MS: &str = "GATEWAY_MIN_SILENCE_THRESHOLD_MS";
/// Overrides the upstream generator URL.
pub const ENV_BACKEND_URL: &str = "GATEWAY_BACKEND_URL";

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { key: &'static str, value: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { key, value } => write!(f, "Invalid value for {}: {:?}", key, value),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration from an optional TOML file, apply environment
/// overrides, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => GatewayConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply the recognised environment overrides using `lookup` as the source.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_MIN_COMPLETION_TIMEOUT_MS) {
        config.timeouts.min_completion_timeout_ms = parse_ms(ENV_MIN_COMPLETION_TIMEOUT_MS, value)?;
    }
    if let Some(value) = lookup(ENV_MIN_SILENCE_THRESHOLD_MS) {
        config.timeouts.min_silence_threshold_ms = parse_ms(ENV_MIN_SILENCE_THRESHOLD_MS, value)?;
    }
    if let Some(value) = lookup(ENV_BACKEND_URL) {
        config.backend.url = value;
    }
    Ok(())
}

fn parse_ms(key: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}
