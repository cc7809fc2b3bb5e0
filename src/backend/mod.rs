//! Generation backend subsystem.
//!
//! # Data Flow
//! ```text
//! Queue manager holds the processing permit:
//!     → switch_model / apply_params (only when they changed)
//!     → start (opens the generation, returns a RawEventSource)
//!     → upstream.rs reader task feeds the source from NDJSON frames
//! ```
//!
//! # Design Decisions
//! - The queue depends on the `GenerationBackend` trait, not on HTTP
//! - Every call is bounded by a timeout inside the implementation
//! - Failures surface as `GatewayError::Backend` with the upstream message

pub mod upstream;

use futures_util::future::BoxFuture;

use crate::error::GatewayResult;
use crate::queue::{GenerationParams, GenerationRequest, RequestId};
use crate::stream::RawEventSource;

pub use upstream::{UpstreamBackend, UpstreamError};

/// A single-capacity generator the gateway serializes access to.
pub trait GenerationBackend: Send + Sync {
    /// Begin generating for `request`.
    fn start<'a>(
        &'a self,
        id: RequestId,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, GatewayResult<Box<dyn RawEventSource>>>;

    /// Switch the generator to `model`.
    fn switch_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, GatewayResult<()>>;

    /// Apply sampling parameters for the next generation.
    fn apply_params<'a>(&'a self, params: &'a GenerationParams) -> BoxFuture<'a, GatewayResult<()>>;
}
