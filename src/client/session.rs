//! Per-request dispatch: walk the query plan, pick the least busy
//! connection, reserve a stream and hand the write to the transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::cluster::ClusterState;
use crate::errors::RequestError;
use crate::network::connection::{PendingRequest, SerializedRequest};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};

/// Dispatches requests to the best-suited host according to the configured
/// load balancing policy.
///
/// The dispatcher introduces no ordering of its own: the policy alone
/// decides host order, and within a host the only freedom taken is retrying
/// a lost reservation race on another connection of the same pool, bounded
/// by the pool's size.
pub struct SessionDispatcher {
    manager: Arc<ConnectionPoolManager>,
    policy: Arc<dyn LoadBalancingPolicy>,
    cluster: Arc<ClusterState>,
}

impl SessionDispatcher {
    pub fn new(
        manager: Arc<ConnectionPoolManager>,
        policy: Arc<dyn LoadBalancingPolicy>,
        cluster: Arc<ClusterState>,
    ) -> Self {
        Self {
            manager,
            policy,
            cluster,
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.manager
    }

    /// Places `request` on a connection of the first host in the query plan
    /// that can take it.
    ///
    /// Returns the pending request (carrying the reserved stream id) on
    /// success, or [`RequestError::NoHostAvailable`] with the hosts that
    /// were skipped or exhausted, in plan order.
    pub fn dispatch(
        &self,
        routing_info: &RoutingInfo,
        request: SerializedRequest,
    ) -> Result<PendingRequest, RequestError> {
        let plan = Plan::new(&*self.policy, routing_info, &self.cluster);
        let mut tried_hosts: Vec<SocketAddr> = Vec::new();

        'hosts_in_plan: for host in plan {
            let address = host.address;
            if !host.is_up() {
                trace!("[{}] Host is not up, skipping", address);
                tried_hosts.push(address);
                continue 'hosts_in_plan;
            }
            let Some(pool) = self.manager.pool(address) else {
                trace!("[{}] No pool for host, skipping", address);
                tried_hosts.push(address);
                continue 'hosts_in_plan;
            };

            // Another writer may take the last free stream between selection
            // and reservation; retry within the pool, bounded by its size.
            let attempts = pool.connection_count().max(1);
            'same_host_retries: for _ in 0..attempts {
                let Some(conn) = pool.find_least_busy() else {
                    trace!("[{}] Pool has no connection with a free stream", address);
                    break 'same_host_retries;
                };
                match conn.send_request(request.clone()) {
                    Ok(pending) => {
                        trace!(
                            "[{}] Request placed on connection {}, stream {}",
                            address,
                            conn.id(),
                            pending.stream_id(),
                        );
                        return Ok(pending);
                    }
                    Err(err) => {
                        trace!(
                            "[{}] Reservation failed on connection {}: {}",
                            address,
                            conn.id(),
                            err,
                        );
                        continue 'same_host_retries;
                    }
                }
            }
            tried_hosts.push(address);
        }

        trace!(
            "Query plan exhausted after trying {} hosts",
            tried_hosts.len(),
        );
        Err(RequestError::NoHostAvailable { tried_hosts })
    }
}
