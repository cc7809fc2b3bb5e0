//! Caller connection subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP handler accepts a request
//!     → connection.rs (ClientConnection + ConnectionGuard pair)
//!     → guard stays with the response, handle goes into the queue
//!     → liveness.rs (bounded probe from the sweep and the arbiter)
//! ```
//!
//! # Design Decisions
//! - The queue depends on a capability trait, not on a transport
//! - Probes are bounded and fail safe toward "alive"

pub mod connection;
pub mod liveness;

pub use connection::{connection_pair, ClientConnection, ConnectionGuard, ConnectionId, ConnectionProbe};
pub use liveness::is_alive;
