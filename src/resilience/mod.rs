//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request dequeued:
//!     → timeouts.rs (TTFB / silence / hard budgets from request size)
//!     → stream machine enforces the budgets tick by tick
//!
//! Upstream stream open fails:
//!     → backoff.rs (jittered exponential delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every generation has a hard deadline
//! - Only stream establishment is retried; a started generation never is
//! - Jittered backoff keeps retries from hammering a single-capacity backend

pub mod backoff;
pub mod timeouts;

pub use backoff::StartBackoff;
pub use timeouts::{saturating_secs, PolicySettings, TimeoutPolicy, MAX_BUDGET_SECS};
