use tracing::error;

use super::{FallbackPlan, LoadBalancingPolicy, RoutingInfo};
use crate::cluster::{ClusterState, HostRef};

enum PlanState<'a> {
    Created,
    // Abnormal: no host satisfied the policy's requirements.
    PickedNone,
    Picked(HostRef<'a>),
    Fallback {
        iter: FallbackPlan<'a>,
        host_to_filter_out: HostRef<'a>,
    },
}

/// The ordered list of candidate hosts for one request.
///
/// The first host is computed eagerly; the rest of the plan is only built
/// if it is needed, which keeps the happy path (first host takes the
/// request) allocation-free. The picked host is filtered out of the
/// fallback so no host appears twice.
pub struct Plan<'a> {
    policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo,
    cluster: &'a ClusterState,

    state: PlanState<'a>,
}

impl<'a> Plan<'a> {
    pub fn new(
        policy: &'a dyn LoadBalancingPolicy,
        routing_info: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Self {
        Self {
            policy,
            routing_info,
            cluster,
            state: PlanState::Created,
        }
    }
}

impl<'a> Iterator for Plan<'a> {
    type Item = HostRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            PlanState::Created => {
                let picked = self.policy.pick(self.routing_info, self.cluster);
                if let Some(picked) = picked {
                    self.state = PlanState::Picked(picked);
                    Some(picked)
                } else {
                    // `pick` returning None does not imply an empty plan;
                    // the fallback may still hold usable hosts.
                    let mut iter = self.policy.fallback(self.routing_info, self.cluster);
                    let first_fallback_host = iter.next();
                    if let Some(host) = first_fallback_host {
                        self.state = PlanState::Fallback {
                            iter,
                            host_to_filter_out: host,
                        };
                        Some(host)
                    } else {
                        error!("Load balancing policy returned an empty plan!");
                        self.state = PlanState::PickedNone;
                        None
                    }
                }
            }
            PlanState::Picked(host) => {
                self.state = PlanState::Fallback {
                    iter: self.policy.fallback(self.routing_info, self.cluster),
                    host_to_filter_out: *host,
                };
                self.next()
            }
            PlanState::Fallback {
                iter,
                host_to_filter_out,
            } => {
                for host in iter {
                    if std::sync::Arc::ptr_eq(host, host_to_filter_out) {
                        continue;
                    }
                    return Some(host);
                }
                None
            }
            PlanState::PickedNone => None,
        }
    }
}
