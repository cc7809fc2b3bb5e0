//! Admission queue subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP handler
//!     → manager.rs enqueue (FIFO tail, Ticket back to the caller)
//!     → worker: acquire permit → prepare backend → start generation
//!     → stream machine + arbiter deliver onto the Ticket channel
//!     → permit guard drops, next request is dequeued
//!
//! Sweeper (every sweep interval):
//!     → bounded liveness probe per waiting caller
//!     → dead callers evicted, lifecycle = evicted_disconnected
//! ```
//!
//! # Design Decisions
//! - Capacity is exactly one generation; the permit enforces it
//! - Each request's lifecycle lives in one shared record
//! - Rotation invalidates the current id; the session notices within a tick

pub mod manager;
pub mod request;
pub mod state;

pub use manager::{QueueManager, QueueSettings, QueueStatus, RequestStatus, Ticket};
pub use request::{
    ChatMessage, GenerationParams, GenerationRequest, LifecycleState, QueuedRequest, RequestId,
    RequestRecord,
};
pub use state::{ProcessingPermit, QueueState, PERMIT_CAPACITY};
