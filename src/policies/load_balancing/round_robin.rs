use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::{compute_rotation, slice_rotated_left, FallbackPlan, LoadBalancingPolicy, RoutingInfo};
use crate::cluster::{ClusterState, HostRef};

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Cycles through the cluster's hosts, one starting point per request.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn pick<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<HostRef<'a>> {
        let hosts = cluster.hosts();
        if hosts.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, ORDER_TYPE);
        let host = &hosts[compute_rotation(index, hosts.len())];
        trace!("[{}] RoundRobin picked", host.address);
        Some(host)
    }

    fn fallback<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let hosts = cluster.hosts();
        let index = self.index.fetch_add(1, ORDER_TYPE);
        let rotation = compute_rotation(index, hosts.len());
        Box::new(slice_rotated_left(hosts, rotation))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::cluster::Host;
    use crate::utils::test_utils::setup_tracing;

    fn cluster_of(addresses: &[&str]) -> ClusterState {
        ClusterState::new(
            addresses
                .iter()
                .map(|addr| Host::new(addr.parse::<SocketAddr>().unwrap())),
        )
    }

    #[test]
    fn pick_cycles_through_all_hosts() {
        setup_tracing();
        let policy = RoundRobinPolicy::new();
        let cluster = cluster_of(&["10.0.0.1:9042", "10.0.0.2:9042", "10.0.0.3:9042"]);
        let routing_info = RoutingInfo::default();

        let picked: Vec<SocketAddr> = (0..6)
            .map(|_| policy.pick(&routing_info, &cluster).unwrap().address)
            .collect();
        let expected: Vec<SocketAddr> = cluster
            .hosts()
            .iter()
            .chain(cluster.hosts().iter())
            .map(|host| host.address)
            .collect();
        assert_eq!(picked, expected);
    }

    #[test]
    fn fallback_is_a_rotation_of_all_hosts() {
        setup_tracing();
        let policy = RoundRobinPolicy::new();
        let cluster = cluster_of(&["10.0.0.1:9042", "10.0.0.2:9042", "10.0.0.3:9042"]);
        let routing_info = RoutingInfo::default();

        let plan: Vec<SocketAddr> = policy
            .fallback(&routing_info, &cluster)
            .map(|host| host.address)
            .collect();
        assert_eq!(plan.len(), 3);
        let mut sorted = plan.clone();
        sorted.sort_unstable();
        let mut expected: Vec<SocketAddr> =
            cluster.hosts().iter().map(|host| host.address).collect();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn pick_returns_none_for_empty_cluster() {
        setup_tracing();
        let policy = RoundRobinPolicy::new();
        let cluster = ClusterState::default();
        let routing_info = RoutingInfo::default();
        assert!(policy.pick(&routing_info, &cluster).is_none());
    }
}
