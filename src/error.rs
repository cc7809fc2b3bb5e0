//! Gateway error taxonomy.
//!
//! # Classes
//! - `Configuration`: a shared primitive is missing or torn down (fatal)
//! - `Disconnected`: caller went away (recovered locally, never a 5xx)
//! - `TtfbTimeout` / `SilenceTimeout` / `HardTimeout`: generation stalled (retryable)
//! - `Superseded`: a rotation raced the in-flight session (retryable)
//! - `Backpressure`: a streaming caller stopped reading (request-scoped)
//! - `Backend`: the raw source reported failure (request-scoped, verbatim)
//!
//! # Design Decisions
//! - Only `Configuration` may terminate the process
//! - Generation-side errors are scoped to one request and one session

use thiserror::Error;

use crate::resilience::TimeoutPolicy;
use crate::stream::TerminalReason;

/// Errors surfaced by the gateway core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// A shared primitive was missing or closed when it was needed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The caller's connection is gone.
    #[error("Client disconnected")]
    Disconnected,

    /// No content arrived within the time-to-first-byte budget.
    #[error("No response within {0:.1}s time-to-first-byte budget")]
    TtfbTimeout(f64),

    /// The stream went silent longer than the silence budget.
    #[error("Stream silent for longer than {0:.1}s")]
    SilenceTimeout(f64),

    /// The absolute generation ceiling was reached.
    #[error("Generation exceeded hard limit of {0:.1}s")]
    HardTimeout(f64),

    /// The session was invalidated by a backend rotation.
    #[error("Generation superseded by backend rotation")]
    Superseded,

    /// A streaming caller left a delta unread for longer than the send budget.
    #[error("Caller did not accept output within {0:.1}s")]
    Backpressure(f64),

    /// The generation backend reported a failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    /// Whether the caller may safely resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TtfbTimeout(_)
                | GatewayError::SilenceTimeout(_)
                | GatewayError::HardTimeout(_)
                | GatewayError::Superseded
        )
    }

    /// Terminal reason code attached to this error, if it maps to one.
    pub fn reason(&self) -> Option<TerminalReason> {
        match self {
            GatewayError::TtfbTimeout(_) => Some(TerminalReason::TtfbTimeout),
            GatewayError::SilenceTimeout(_) => Some(TerminalReason::SilenceDetected),
            GatewayError::HardTimeout(_) => Some(TerminalReason::HardTimeout),
            GatewayError::Superseded => Some(TerminalReason::Superseded),
            _ => None,
        }
    }

    /// Error for a non-successful terminal reason under `policy`.
    pub fn from_reason(reason: TerminalReason, policy: &TimeoutPolicy) -> Option<Self> {
        match reason {
            TerminalReason::Completed => None,
            TerminalReason::TtfbTimeout => Some(GatewayError::TtfbTimeout(policy.ttfb_budget)),
            TerminalReason::SilenceDetected => {
                Some(GatewayError::SilenceTimeout(policy.streaming_budget()))
            }
            TerminalReason::HardTimeout => Some(GatewayError::HardTimeout(policy.hard_limit)),
            TerminalReason::Superseded => Some(GatewayError::Superseded),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
