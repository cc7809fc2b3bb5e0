//! Raw generation event sources.
//!
//! # Responsibilities
//! - Define the raw event vocabulary of a generator (fragment, finish, failure)
//! - Offer a bounded-wait pull interface to the stream machine
//! - Expose the generator's optional "still generating" signal
//!
//! # Design Decisions
//! - Sources are pull-based with an explicit wait budget; the machine never
//!   blocks longer than one tick on a source
//! - `ChannelSource` owns the task that feeds it and aborts it on drop, so
//!   abandoning a session stops upstream reads

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Event emitted by a generator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// A piece of generated content.
    Fragment(String),
    /// The generator finished normally.
    Finished,
    /// The generator failed with a message.
    Failed(String),
}

/// Result of one bounded pull.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Event(RawEvent),
    /// Nothing arrived within the wait budget.
    Idle,
    /// The producer went away without a finish marker.
    Closed,
}

/// Pull interface over a generator's events.
pub trait RawEventSource: Send {
    /// Wait at most `wait` for the next event. A zero wait only returns
    /// already buffered events.
    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, SourcePoll>;

    /// Whether the generator reports itself busy; `None` if it has no such signal.
    fn is_generating(&self) -> Option<bool>;
}

/// Producer half of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct SourceFeed {
    events: mpsc::Sender<RawEvent>,
    busy: Arc<watch::Sender<bool>>,
}

impl SourceFeed {
    /// Push an event. Returns `false` once the consumer is gone.
    pub async fn push(&self, event: RawEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn fragment(&self, text: impl Into<String>) -> bool {
        self.push(RawEvent::Fragment(text.into())).await
    }

    pub async fn finish(&self) -> bool {
        self.push(RawEvent::Finished).await
    }

    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.push(RawEvent::Failed(message.into())).await
    }

    /// Update the busy signal.
    pub fn set_generating(&self, active: bool) {
        self.busy.send_replace(active);
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Channel-backed event source.
#[derive(Debug)]
pub struct ChannelSource {
    events: mpsc::Receiver<RawEvent>,
    busy: Option<watch::Receiver<bool>>,
    reader: Option<JoinHandle<()>>,
}

/// Create a linked feed and source with room for `capacity` buffered events.
pub fn channel_source(capacity: usize) -> (SourceFeed, ChannelSource) {
    let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
    let (busy_tx, busy_rx) = watch::channel(false);
    (
        SourceFeed {
            events: events_tx,
            busy: Arc::new(busy_tx),
        },
        ChannelSource {
            events: events_rx,
            busy: Some(busy_rx),
            reader: None,
        },
    )
}

impl ChannelSource {
    /// Tie the lifetime of `reader` to this source.
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Drop the busy signal; `is_generating` then reports `None`.
    pub fn without_busy_signal(mut self) -> Self {
        self.busy = None;
        self
    }
}

impl RawEventSource for ChannelSource {
    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, SourcePoll> {
        Box::pin(async move {
            if wait.is_zero() {
                return match self.events.try_recv() {
                    Ok(event) => SourcePoll::Event(event),
                    Err(mpsc::error::TryRecvError::Empty) => SourcePoll::Idle,
                    Err(mpsc::error::TryRecvError::Disconnected) => SourcePoll::Closed,
                };
            }
            match time::timeout(wait, self.events.recv()).await {
                Ok(Some(event)) => SourcePoll::Event(event),
                Ok(None) => SourcePoll::Closed,
                Err(_) => SourcePoll::Idle,
            }
        })
    }

    fn is_generating(&self) -> Option<bool> {
        self.busy.as_ref().map(|rx| *rx.borrow())
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
