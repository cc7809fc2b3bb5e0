//! Bounded caller liveness checks.
//!
//! # Design Decisions
//! - Every probe is wrapped in a Tokio timeout; there is no unbounded path
//! - A probe that cannot settle within the budget counts as alive, so a slow
//!   scheduler tick never evicts a live caller
//! - Only an observed disconnect returns `false`

use std::time::Duration;
use tokio::time;

use crate::net::connection::ConnectionProbe;

/// Default liveness poll budget.
pub const DEFAULT_POLL_BUDGET: Duration = Duration::from_millis(10);

/// Return `false` only if `probe` reports a disconnect within `poll_budget`.
pub async fn is_alive(probe: &dyn ConnectionProbe, poll_budget: Duration) -> bool {
    if probe.is_disconnected() {
        return false;
    }
    match time::timeout(poll_budget, probe.disconnected()).await {
        Ok(()) => false,
        Err(_) => true,
    }
}
