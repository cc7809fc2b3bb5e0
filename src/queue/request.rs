//! Queued request types and lifecycle records.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::net::ConnectionProbe;
use crate::stream::ResponseEvent;

/// Unique identifier of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0.simple())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    /// Accepts both the bare UUID and the `req-` display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("req-").unwrap_or(s);
        Uuid::parse_str(raw).map(Self)
    }
}

/// One chat turn of a request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Sampling parameters forwarded to the generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// The caller's generation payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Build a plain prompt request.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            prompt: Some(text.into()),
            ..Self::default()
        }
    }

    /// Request size in characters; drives the timeout policy.
    pub fn size_chars(&self) -> usize {
        let prompt = self.prompt.as_deref().map_or(0, |p| p.chars().count());
        let messages: usize = self
            .messages
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        prompt + messages
    }

    /// Flatten messages and prompt into the single text the generator receives.
    pub fn rendered_prompt(&self) -> String {
        let mut parts: Vec<String> = self
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        if let Some(prompt) = &self.prompt {
            parts.push(prompt.clone());
        }
        parts.join("\n\n")
    }
}

/// Lifecycle of a queued request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Queued = 0,
    Dequeued = 1,
    Completed = 2,
    EvictedDisconnected = 3,
}

impl From<u8> for LifecycleState {
    fn from(val: u8) -> Self {
        match val {
            1 => LifecycleState::Dequeued,
            2 => LifecycleState::Completed,
            3 => LifecycleState::EvictedDisconnected,
            _ => LifecycleState::Queued,
        }
    }
}

impl LifecycleState {
    /// Completed and evicted requests never change again.
    pub fn is_final(self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::EvictedDisconnected)
    }

    fn can_become(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Queued, LifecycleState::Dequeued)
                | (LifecycleState::Queued, LifecycleState::EvictedDisconnected)
                | (LifecycleState::Dequeued, LifecycleState::Completed)
        )
    }
}

/// Shared lifecycle record of one request.
///
/// The queue entry and the status registry hold the same `Arc`, so there is
/// exactly one copy of the state.
#[derive(Debug)]
pub struct RequestRecord {
    id: RequestId,
    state: AtomicU8,
    enqueued_at: Instant,
    dequeued_at: OnceLock<Instant>,
    finished_at: OnceLock<Instant>,
}

impl RequestRecord {
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            state: AtomicU8::new(LifecycleState::Queued as u8),
            enqueued_at: Instant::now(),
            dequeued_at: OnceLock::new(),
            finished_at: OnceLock::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn dequeued_at(&self) -> Option<Instant> {
        self.dequeued_at.get().copied()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub(crate) fn transition(&self, next: LifecycleState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !LifecycleState::from(current).can_become(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let now = Instant::now();
        match next {
            LifecycleState::Dequeued => {
                let _ = self.dequeued_at.set(now);
            }
            LifecycleState::Completed | LifecycleState::EvictedDisconnected => {
                let _ = self.finished_at.set(now);
            }
            LifecycleState::Queued => {}
        }
        true
    }
}

/// A request waiting in (or just popped from) the FIFO.
pub struct QueuedRequest {
    pub id: RequestId,
    pub request: GenerationRequest,
    pub connection: Arc<dyn ConnectionProbe>,
    pub responder: mpsc::Sender<ResponseEvent>,
    pub record: Arc<RequestRecord>,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("state", &self.record.state())
            .field("stream", &self.request.stream)
            .finish()
    }
}

impl QueuedRequest {
    pub fn state(&self) -> LifecycleState {
        self.record.state()
    }
}
