//! Caller connection handles and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Give the queue a capability to ask "has this caller gone away?"
//! - Flip that answer when the HTTP layer drops the caller's response
//!
//! # Design Decisions
//! - The HTTP layer holds a `ConnectionGuard` inside the handler future or
//!   response body; hyper drops it when the peer disconnects
//! - The queue only ever sees the `ConnectionProbe` trait, never a transport

use std::sync::atomic::{AtomicU64, Ordering};
use futures_util::future::BoxFuture;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Capability to observe a caller's disconnect.
///
/// `disconnected()` resolves once the peer is gone and may never resolve for
/// a live peer; callers must bound the wait (see `net::liveness`).
pub trait ConnectionProbe: Send + Sync {
    /// Non-blocking check for an already observed disconnect.
    fn is_disconnected(&self) -> bool;

    /// Resolves when the peer disconnects.
    fn disconnected(&self) -> BoxFuture<'_, ()>;

    /// Identifier used in logs.
    fn id(&self) -> ConnectionId;
}

/// Queue-side half of a caller connection.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    rx: watch::Receiver<bool>,
}

/// Transport-side half of a caller connection.
/// Marks the connection disconnected when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    tx: watch::Sender<bool>,
}

/// Create a linked connection handle and guard.
pub fn connection_pair() -> (ClientConnection, ConnectionGuard) {
    let id = ConnectionId::new();
    let (tx, rx) = watch::channel(false);
    (ClientConnection { id, rx }, ConnectionGuard { id, tx })
}

impl ConnectionProbe for ClientConnection {
    fn is_disconnected(&self) -> bool {
        // has_changed errors once the guard (sender) is gone.
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    fn disconnected(&self) -> BoxFuture<'_, ()> {
        let mut rx = self.rx.clone();
        Box::pin(async move {
            loop {
                let gone = *rx.borrow_and_update();
                if gone {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Explicitly mark the caller as gone.
    pub fn disconnect(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
