//! Load balancing: per-request host ordering.
//!
//! A policy produces a *query plan*: an ordered, one-shot iterator of
//! candidate hosts. The dispatcher walks the plan without reordering it;
//! anything smarter than "next host, please" belongs in the policy.

use std::time::Duration;

use crate::cluster::{ClusterState, HostRef};
use crate::errors::RequestAttemptError;

mod plan;
mod round_robin;
pub use plan::Plan;
pub use round_robin::RoundRobinPolicy;

/// Statement properties a policy may consult when routing. The pool core
/// passes it through opaquely; richer routing inputs (tokens, consistency)
/// live above this crate.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct RoutingInfo {
    /// True if the request can safely be retried on another host.
    pub is_idempotent: bool,
}

/// The part of the plan after the first target.
///
/// Computed on demand, only when the first target could not take
/// the request.
pub type FallbackPlan<'a> = Box<dyn Iterator<Item = HostRef<'a>> + Send + Sync + 'a>;

/// Decides which hosts to contact for each request, and in what order.
///
/// Most requests succeed on the first attempt, so the interface is split the
/// way the driver consumes it: `pick` cheaply returns the preferred host,
/// and `fallback` produces the rest of the plan only when needed.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the preferred host for a request, or `None` if one cannot be
    /// computed cheaply. `fallback` is consulted either way.
    fn pick<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState)
        -> Option<HostRef<'a>>;

    /// Returns every contact-appropriate host for a request, best first.
    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a>;

    /// Invoked each time a request succeeds.
    fn on_request_success(&self, _request: &RoutingInfo, _latency: Duration, _host: HostRef<'_>) {}

    /// Invoked each time a request fails.
    fn on_request_failure(
        &self,
        _request: &RoutingInfo,
        _latency: Duration,
        _host: HostRef<'_>,
        _error: &RequestAttemptError,
    ) {
    }

    /// Name of the policy, for diagnostics.
    fn name(&self) -> String;
}

// Rotation helpers shared by policies that hand out hosts in a
// cycling order.

pub(crate) fn compute_rotation(index: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    index % count
}

pub(crate) fn slice_rotated_left<T>(slice: &[T], mid: usize) -> impl Iterator<Item = &T> {
    slice[mid..].iter().chain(slice[..mid].iter())
}
