//! Per-request streaming session state.
//!
//! # Responsibilities
//! - Track the session phase and enforce that it only moves forward
//! - Count content fragments and record the time of the last one
//! - Accumulate content for batched delivery
//! - Hold the snooze credits used while the generator reports itself busy

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::queue::RequestId;

/// Phase of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    AwaitingFirstByte,
    Streaming,
    Finalized,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Finalized | SessionPhase::Aborted)
    }

    fn allows(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (AwaitingFirstByte, Streaming) | (Streaming, Finalized) => true,
            // A session that timed out before its first byte still finalizes.
            (AwaitingFirstByte, Finalized) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// State of one generation as observed by the gateway.
#[derive(Debug)]
pub struct StreamSession {
    id: RequestId,
    phase: SessionPhase,
    received: u64,
    started_at: Instant,
    last_activity: Instant,
    content: String,
    consecutive_snoozes: u32,
}

impl StreamSession {
    pub fn new(id: RequestId) -> Self {
        let now = Instant::now();
        Self {
            id,
            phase: SessionPhase::AwaitingFirstByte,
            received: 0,
            started_at: now,
            last_activity: now,
            content: String::new(),
            consecutive_snoozes: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Fragments received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn consecutive_snoozes(&self) -> u32 {
        self.consecutive_snoozes
    }

    /// Move to `next`. Backward or post-terminal moves are rejected.
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.allows(next) {
            tracing::debug!(
                request_id = %self.id,
                from = ?self.phase,
                to = ?next,
                "Rejected session phase change"
            );
            return false;
        }
        self.phase = next;
        true
    }

    /// Record a content fragment received at `now`.
    ///
    /// Ignored once the session is finalized or aborted.
    pub fn record_fragment(&mut self, text: &str, now: Instant) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.advance(SessionPhase::Streaming);
        self.received += 1;
        self.last_activity = now;
        self.consecutive_snoozes = 0;
        self.content.push_str(text);
        true
    }

    /// Spend one snooze credit, halving the idle time observed at `now`.
    ///
    /// Returns `false` once `max` consecutive snoozes have been spent.
    pub fn snooze(&mut self, now: Instant, max: u32) -> bool {
        if self.consecutive_snoozes >= max {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        self.last_activity = now - idle / 2;
        self.consecutive_snoozes += 1;
        true
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Take the accumulated content, leaving the session empty.
    pub fn take_content(&mut self) -> String {
        std::mem::take(&mut self.content)
    }

    pub fn finalize(&mut self) -> bool {
        self.advance(SessionPhase::Finalized)
    }

    pub fn abort(&mut self) -> bool {
        self.advance(SessionPhase::Aborted)
    }
}
