//! Connections to the cluster and management over them.
//!
//! The main abstractions, bottom up:
//! - [`Connection`] / [`Connector`] - the seam to the transport layer,
//! - [`PooledConnection`] - a connection plus the stream accounting and
//!   write batching the pool needs,
//! - `ConnectionPool` - keeps a target number of live connections to
//!   one host,
//! - [`ConnectionPoolManager`] - the address -> pool map, lifecycle events
//!   and shutdown.

pub mod connection;
pub use connection::{
    Connection, ConnectionConfig, ConnectionId, Connector, ErrorReceiver, PendingRequest,
    PoolConfig, PooledConnection, ResponseFrame, ResponseSender, SerializedRequest, StreamId,
};

mod connection_pool;

mod host_counter;

mod pool_connector;

pub mod pool_manager;
pub use pool_manager::{ConnectionPoolManager, PoolListener};

mod trashcan;

#[cfg(test)]
mod pool_manager_test;
