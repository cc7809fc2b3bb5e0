//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, body limit, tracing)
//!     → POST /v1/generate: connection pair + enqueue
//!     → batched: wait for the final event on the ticket
//!     → streaming: SSE queued / delta / done events
//!     → response.rs (status mapping, JSON and SSE payloads)
//! ```

pub mod response;
pub mod server;

pub use server::{AppState, HttpServer};
