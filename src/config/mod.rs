//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize, apply env overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → timeout floors handed to the policy calculator once at startup
//! ```
//!
//! # Design Decisions
//! - Config is read once at process start; there is no reload path
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::GatewayConfig;
pub use schema::ListenerConfig;
pub use schema::QueueConfig;
pub use schema::TimeoutConfig;
pub use schema::BackendConfig;
pub use schema::ObservabilityConfig;
