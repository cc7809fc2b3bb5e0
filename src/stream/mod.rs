//! Stream timeout subsystem.
//!
//! # Data Flow
//! ```text
//! Backend starts a generation:
//!     → source.rs (raw fragments, finish/failure markers, busy signal)
//!     → machine.rs (TTFB / silence / hard budgets, snooze, supersession)
//!     → arbiter.rs (first terminal wins, later events discarded)
//!     → caller's response channel
//! ```
//!
//! # Design Decisions
//! - The machine emits exactly one terminal event per session
//! - Session state is owned by the machine; the arbiter only finalizes it
//! - Reason codes are a closed set with stable wire strings

pub mod arbiter;
pub mod machine;
pub mod session;
pub mod source;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use arbiter::{Completion, DeliveryMode, Delivery, Outcome, ResponseArbiter, ResponseEvent};
pub use machine::{MachineSettings, StreamTimeoutMachine};
pub use session::{SessionPhase, StreamSession};
pub use source::{channel_source, ChannelSource, RawEvent, RawEventSource, SourceFeed, SourcePoll};

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    TtfbTimeout,
    SilenceDetected,
    HardTimeout,
    Superseded,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::TtfbTimeout => "ttfb_timeout",
            TerminalReason::SilenceDetected => "silence_detected",
            TerminalReason::HardTimeout => "hard_timeout",
            TerminalReason::Superseded => "superseded",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event produced by the stream timeout machine.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    /// A content fragment.
    Data(String),
    /// The session ended for `reason`.
    Terminal(TerminalReason),
    /// The raw source failed; carries its message verbatim.
    BackendFailure(String),
}

impl NormalizedEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NormalizedEvent::Data(_))
    }
}
