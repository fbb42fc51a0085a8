//! Connection pool manager and session dispatch core for drivers of
//! CQL-speaking wide-column clusters (the Cassandra family).
//!
//! The crate keeps one pool of multiplexed connections per reachable host,
//! drives each pool through its connect/up/down/close lifecycle, and
//! dispatches requests to the best-suited host according to a load balancing
//! policy. Wire framing, codecs, TLS and authentication stay below the
//! [`Connector`] seam; topology discovery stays above it - the session is
//! handed an already-populated host set.
//!
//! # Overview
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cql_pool::{
//!     ClusterState, ConnectionPoolManager, Connector, Host, HostStateListener, PoolConfig,
//!     RoundRobinPolicy, SessionDispatcher,
//! };
//!
//! # fn example(connector: Arc<dyn Connector>) {
//! let address = "10.0.0.1:9042".parse().unwrap();
//! let cluster = Arc::new(ClusterState::new([Host::new(address)]));
//!
//! let manager = Arc::new(ConnectionPoolManager::new(
//!     connector,
//!     PoolConfig::default(),
//!     None,
//! ));
//! manager.set_listener(Some(Arc::new(HostStateListener::new(cluster.clone()))));
//! manager.add(address);
//!
//! let _dispatcher = SessionDispatcher::new(
//!     manager,
//!     Arc::new(RoundRobinPolicy::new()),
//!     cluster,
//! );
//! # }
//! ```
//!
//! Requests are then placed with
//! [`SessionDispatcher::dispatch`](client::session::SessionDispatcher::dispatch),
//! which walks the policy's query plan, reserves a stream id on the least
//! busy connection of the chosen pool and returns a
//! [`PendingRequest`] to await.

pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;

mod utils;

pub use client::session::SessionDispatcher;
pub use cluster::{ClusterState, Host, HostRef, HostState, HostStateListener};
pub use network::{
    Connection, ConnectionConfig, ConnectionId, ConnectionPoolManager, Connector, ErrorReceiver,
    PendingRequest, PoolConfig, PoolListener, PooledConnection, ResponseFrame, ResponseSender,
    SerializedRequest, StreamId,
};
pub use policies::load_balancing::{
    FallbackPlan, LoadBalancingPolicy, Plan, RoundRobinPolicy, RoutingInfo,
};
