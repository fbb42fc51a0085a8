//! One-shot bring-up of a new pool: opens the initial set of connections for
//! an address and reports a ready pool, or the critical failure that
//! prevented one.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, trace};

use crate::errors::ConnectionError;
use crate::network::connection::{
    Connection, ConnectionConfig, Connector, ErrorReceiver, PoolConfig,
};
use crate::network::connection_pool::ConnectionPool;
use crate::network::host_counter::{HostConnectionCounter, HostConnectionGuard};
use crate::network::pool_manager::ManagerChannel;

/// A freshly-established connection together with its error channel and the
/// host-counter admission it holds.
pub(crate) struct NewConnection {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) error_receiver: ErrorReceiver,
    pub(crate) count_guard: HostConnectionGuard,
}

/// Runs one connect attempt while holding a host-counter admission. The
/// admission travels with the connection on success and is released on
/// failure (or whenever the attempt is dropped mid-flight).
pub(crate) async fn open_connection(
    connector: &dyn Connector,
    address: SocketAddr,
    config: ConnectionConfig,
    count_guard: HostConnectionGuard,
) -> Result<NewConnection, ConnectionError> {
    let (conn, error_receiver) = connector.connect(address, &config).await?;
    Ok(NewConnection {
        conn,
        error_receiver,
        count_guard,
    })
}

/// Brings up the initial connections for a pool that does not exist yet.
///
/// One-shot: opens `num_connections_per_host` connects in parallel, builds a
/// ready [`ConnectionPool`] if at least one succeeded, and reports a critical
/// error carrying the first failure otherwise. The outcome is delivered to
/// the manager worker as an event.
///
/// Cancellation is dropping the task this runs in (the manager holds its
/// `RemoteHandle`): after the drop no outcome can ever be delivered, and any
/// connections already established are released through their own drop
/// handlers. This makes cancel idempotent and safe at any completion stage.
pub(crate) struct ConnectionPoolConnector {
    address: SocketAddr,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    keyspace: Arc<StdMutex<Option<String>>>,
    host_counter: HostConnectionCounter,
    manager: ManagerChannel,
}

impl ConnectionPoolConnector {
    pub(crate) fn new(
        address: SocketAddr,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        keyspace: Arc<StdMutex<Option<String>>>,
        host_counter: HostConnectionCounter,
        manager: ManagerChannel,
    ) -> Self {
        Self {
            address,
            config,
            connector,
            keyspace,
            host_counter,
            manager,
        }
    }

    pub(crate) async fn run(self) {
        let address = self.address;
        let manager = self.manager.clone();
        let result = self.connect().await;
        match &result {
            Ok(_) => debug!("[{}] Initial pool fill succeeded", address),
            Err(err) => debug!("[{}] Initial pool fill failed: {}", address, err),
        }
        manager.connector_done(address, result);
    }

    async fn connect(self) -> Result<ConnectionPool, ConnectionError> {
        let target = self.config.num_connections_per_host.get();
        let mut connection_config = self.config.connection_config.clone();
        connection_config.keyspace = self.keyspace.lock().unwrap().clone();

        trace!("[{}] Opening {} initial connections", self.address, target);
        let attempts = (0..target).map(|_| {
            let admission = self.host_counter.try_increase(self.address, target);
            let config = connection_config.clone();
            let connector = self.connector.clone();
            let address = self.address;
            async move {
                let Some(count_guard) = admission else {
                    return Err(ConnectionError::HostLimitReached);
                };
                open_connection(&*connector, address, config, count_guard).await
            }
        });
        let results = futures::future::join_all(attempts).await;

        let mut initial = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(new_conn) => initial.push(new_conn),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if initial.is_empty() {
            return Err(first_error.unwrap_or(ConnectionError::HostLimitReached));
        }
        Ok(ConnectionPool::new(
            self.address,
            self.config,
            self.connector,
            self.keyspace,
            self.manager,
            self.host_counter,
            initial,
        ))
    }
}
