//! Error types used across the pool manager and the session dispatcher.
//!
//! Errors never cross component boundaries as panics. Per-request failures
//! travel through oneshot response channels as [`RequestAttemptError`] or
//! surface to the caller as [`RequestError`]; connection and pool lifecycle
//! failures are reported to the manager's listener as structured
//! [`ConnectionError`] values.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

/// An error that occurred while opening a connection, or the reason
/// an established connection went away.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The transport did not manage to connect within its configured timeout.
    #[error("Connect timeout")]
    ConnectTimeout,

    /// Input/output error, e.g. connection refused by the peer.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The per-host connection ceiling prevented opening the connection.
    #[error("Per-host connection limit reached")]
    HostLimitReached,

    /// An established connection broke.
    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(value))
    }
}

/// The reason an established connection was declared dead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ClosedByPeer,

    /// Input/output error on an established connection.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection accumulated more request errors than the configured
    /// threshold and was torn down by its pool.
    #[error("Connection exceeded its error threshold")]
    TooManyErrors,

    /// The transport dropped its error channel without reporting a reason.
    #[error("Connection handle dropped without reporting an error")]
    ChannelError,

    /// The connection is being shut down; buffered writes were abandoned.
    #[error("Connection is shutting down")]
    Closing,
}

impl ConnectionError {
    /// Flattens the error into the per-connection broken reason used when
    /// failing buffered writes.
    pub(crate) fn to_broken(&self) -> BrokenConnectionError {
        match self {
            ConnectionError::Broken(err) => err.clone(),
            ConnectionError::Io(err) => BrokenConnectionError::Io(err.clone()),
            ConnectionError::ConnectTimeout | ConnectionError::HostLimitReached => {
                BrokenConnectionError::ChannelError
            }
        }
    }
}

/// An error of a single request attempt on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// The connection broke before the response arrived, or the write was
    /// abandoned because the connection is closing.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// No free stream id was available on the connection.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The connection's pending-write queue is full.
    #[error("Write queue is full")]
    WriteQueueFull,
}

/// A terminal request failure surfaced to the dispatcher's caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Every host in the query plan was tried and none could accept
    /// the request.
    #[error("No host could serve the request (tried {} hosts)", tried_hosts.len())]
    NoHostAvailable {
        /// Hosts skipped or exhausted while walking the plan, in plan order.
        tried_hosts: Vec<SocketAddr>,
    },
}

impl RequestError {
    /// Hosts that were tried before the request was given up on.
    pub fn tried_hosts(&self) -> &[SocketAddr] {
        match self {
            RequestError::NoHostAvailable { tried_hosts } => tried_hosts,
        }
    }
}
