//! Per-host connection pool: keeps a target number of live connections,
//! replaces the ones that break and reports lifecycle transitions upward.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::errors::{BrokenConnectionError, ConnectionError};
use crate::network::connection::{
    ConnectionConfig, Connector, ErrorReceiver, PoolConfig, PooledConnection,
};
use crate::network::host_counter::HostConnectionCounter;
use crate::network::pool_connector::{open_connection, NewConnection};
use crate::network::pool_manager::ManagerChannel;

/// Connections of a pool as seen by the read path.
pub(crate) enum PoolConnections {
    /// At least one connection is live. Sorted by connection id.
    Ready(Vec<Arc<PooledConnection>>),
    /// Every connection broke; the pool is reconnecting. Carries the error
    /// from the last attempt.
    Broken(ConnectionError),
    /// The pool is closing or closed and will never serve a connection again.
    Closed,
}

impl std::fmt::Debug for PoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolConnections::Ready(conns) => f
                .debug_list()
                .entries(conns.iter().map(|conn| conn.id()))
                .finish(),
            PoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            PoolConnections::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum PoolCommand {
    Close,
}

/// Handle to a per-host pool. The actual state lives in a [`PoolWorker`]
/// task; the handle only reads published snapshots and posts commands.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    address: SocketAddr,
    conns: Arc<ArcSwap<PoolConnections>>,
    cmd_sender: mpsc::UnboundedSender<PoolCommand>,
    _worker_handle: Arc<RemoteHandle<()>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates a pool over connections brought up by a pool connector and
    /// spawns its worker. `initial` must be non-empty.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: SocketAddr,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        keyspace: Arc<StdMutex<Option<String>>>,
        manager: ManagerChannel,
        host_counter: HostConnectionCounter,
        initial: Vec<NewConnection>,
    ) -> Self {
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(PoolConnections::Ready(Vec::new()))));
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();

        let mut worker = PoolWorker {
            address,
            config,
            connector,
            keyspace,
            manager,
            host_counter,
            shared_conns: shared_conns.clone(),
            conns: Vec::new(),
            next_connection_id: 0,
            pending_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),
            state: PoolState::Ready,
            down_notified: false,
            failed_rounds: 0,
            last_error: None,
            cmd_receiver,
        };
        for new_conn in initial {
            worker.add_connection(new_conn);
        }
        worker.update_shared_conns();

        let (fut, worker_handle) = worker.run().remote_handle();
        tokio::spawn(fut);

        Self {
            address,
            conns: shared_conns,
            cmd_sender,
            _worker_handle: Arc::new(worker_handle),
        }
    }

    /// The live connection with the fewest in-flight streams among those
    /// with at least one free stream id; ties broken by lowest connection
    /// id. None if the pool is empty, saturated, or closing.
    pub(crate) fn find_least_busy(&self) -> Option<Arc<PooledConnection>> {
        match &**self.conns.load() {
            PoolConnections::Ready(conns) => conns
                .iter()
                .filter(|conn| conn.has_free_stream())
                .min_by_key(|conn| (conn.in_flight_count(), conn.id()))
                .cloned(),
            PoolConnections::Broken(_) | PoolConnections::Closed => None,
        }
    }

    /// Snapshot of the pool's live connections, in id order.
    pub(crate) fn working_connections(&self) -> Vec<Arc<PooledConnection>> {
        match &**self.conns.load() {
            PoolConnections::Ready(conns) => conns.clone(),
            PoolConnections::Broken(_) | PoolConnections::Closed => Vec::new(),
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        match &**self.conns.load() {
            PoolConnections::Ready(conns) => conns.len(),
            PoolConnections::Broken(_) | PoolConnections::Closed => 0,
        }
    }

    /// Writes out every connection's buffered requests. Called by the
    /// manager when draining its flush set.
    pub(crate) fn flush(&self) {
        for conn in self.working_connections() {
            conn.flush();
        }
    }

    /// Initiates graceful close. The pool reports `notify_closed` upward
    /// once every connection has been recycled.
    pub(crate) fn close(&self) {
        let _ = self.cmd_sender.send(PoolCommand::Close);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    /// At least one connection is live.
    Ready,
    /// Some connection was lost; replacements are pending or scheduled.
    Reconnecting,
    /// Tearing down; no new connection is ever spawned.
    Closed,
}

struct ConnectAttemptEvent {
    result: Result<NewConnection, ConnectionError>,
}

struct BrokenConnectionEvent {
    connection: Weak<PooledConnection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<PooledConnection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver
            .await
            .unwrap_or_else(|_| BrokenConnectionError::ChannelError.into()),
    }
}

/// Owns all mutable pool state; everything it touches is confined to its
/// task, which plays the role of the event-loop thread.
struct PoolWorker {
    address: SocketAddr,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    keyspace: Arc<StdMutex<Option<String>>>,
    manager: ManagerChannel,
    host_counter: HostConnectionCounter,

    shared_conns: Arc<ArcSwap<PoolConnections>>,
    conns: Vec<Arc<PooledConnection>>,
    next_connection_id: u64,

    /// In-progress attempts to grow the pool back to target.
    pending_connections: FuturesUnordered<BoxFuture<'static, ConnectAttemptEvent>>,
    /// One waiter per live connection, resolving when it breaks.
    connection_errors: FuturesUnordered<BoxFuture<'static, BrokenConnectionEvent>>,

    state: PoolState,
    /// Set once the pool reaches zero live connections; cleared when it
    /// regains one. Debounces up/down notifications to first transitions.
    down_notified: bool,
    failed_rounds: usize,
    last_error: Option<ConnectionError>,

    cmd_receiver: mpsc::UnboundedReceiver<PoolCommand>,
}

impl PoolWorker {
    async fn run(mut self) {
        debug!("[{}] Started pool worker", self.address);

        let mut next_reconnect_time = tokio::time::Instant::now() + self.config.reconnect_wait_time;
        // The initial fill may have come back partial; keep growing.
        let mut reconnect_scheduled = self.needs_filling();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_reconnect_time), if reconnect_scheduled => {
                    reconnect_scheduled = false;
                    self.start_filling();
                }

                evt = self.pending_connections.select_next_some(),
                        if !self.pending_connections.is_empty() => {
                    self.handle_connect_attempt(evt);
                }

                evt = self.connection_errors.select_next_some(),
                        if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!(
                            "[{}] Connection {} broke: {}",
                            self.address,
                            conn.id(),
                            evt.error,
                        );
                        self.remove_connection(conn, evt.error);
                    }
                }

                cmd = self.cmd_receiver.recv() => {
                    // A dropped handle means the manager is gone; close too.
                    match cmd {
                        Some(PoolCommand::Close) | None => {
                            self.close_all();
                            return;
                        }
                    }
                }
            }

            if self.state == PoolState::Closed {
                // The pool gave up reconnecting and unregistered itself.
                return;
            }

            if !reconnect_scheduled && self.needs_filling() {
                let delay = self.config.reconnect_wait_time;
                debug!(
                    "[{}] Scheduling reconnect in {} ms",
                    self.address,
                    delay.as_millis(),
                );
                next_reconnect_time = tokio::time::Instant::now() + delay;
                reconnect_scheduled = true;
            }
        }
    }

    fn needs_filling(&self) -> bool {
        self.conns.len() + self.pending_connections.len()
            < self.config.num_connections_per_host.get()
    }

    // Spawns however many connect attempts are needed to reach the target,
    // so that simultaneous losses coalesce into one growth round.
    fn start_filling(&mut self) {
        if self.conns.is_empty() {
            // An empty pool usually means the host is down; one probe is
            // enough to learn whether it came back.
            trace!("[{}] Will open the first connection to the host", self.address);
            self.start_opening_connection();
            return;
        }
        let target = self.config.num_connections_per_host.get();
        let to_open = target.saturating_sub(self.conns.len() + self.pending_connections.len());
        trace!("[{}] Will open {} connections", self.address, to_open);
        for _ in 0..to_open {
            self.start_opening_connection();
        }
    }

    fn start_opening_connection(&mut self) {
        let cap = self.config.num_connections_per_host.get();
        let Some(count_guard) = self.host_counter.try_increase(self.address, cap) else {
            trace!(
                "[{}] Host already has {} established connections, not opening another",
                self.address,
                self.host_counter.connection_count(self.address),
            );
            return;
        };
        let connector = self.connector.clone();
        let address = self.address;
        let config = self.connection_config_snapshot();
        self.pending_connections.push(
            async move {
                ConnectAttemptEvent {
                    result: open_connection(&*connector, address, config, count_guard).await,
                }
            }
            .boxed(),
        );
    }

    // The keyspace may be changed by application threads at any moment;
    // every connection attempt reads it under the mutex at start time.
    fn connection_config_snapshot(&self) -> ConnectionConfig {
        let mut config = self.config.connection_config.clone();
        config.keyspace = self.keyspace.lock().unwrap().clone();
        config
    }

    fn handle_connect_attempt(&mut self, evt: ConnectAttemptEvent) {
        match evt.result {
            Ok(new_conn) => {
                self.add_connection(new_conn);
                self.failed_rounds = 0;
                self.state = PoolState::Ready;
                if self.down_notified {
                    self.down_notified = false;
                    self.manager.notify_up(self.address);
                }
                debug!(
                    "[{}] Connection ready, pool now has {}",
                    self.address,
                    self.conns.len(),
                );
                self.update_shared_conns();
            }
            Err(err) => {
                debug!("[{}] Failed to open connection: {}", self.address, err);
                self.last_error = Some(err);
                if self.pending_connections.is_empty() && self.conns.is_empty() {
                    self.failed_rounds += 1;
                    self.update_shared_conns();
                    if let Some(limit) = self.config.max_reconnect_attempts {
                        if self.failed_rounds >= limit.get() {
                            warn!(
                                "[{}] Giving up after {} failed reconnect rounds",
                                self.address,
                                self.failed_rounds,
                            );
                            self.close_all();
                        }
                    }
                }
            }
        }
    }

    fn add_connection(&mut self, new_conn: NewConnection) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        let conn = Arc::new(PooledConnection::new(
            id,
            new_conn.conn,
            self.address,
            &self.config,
            self.manager.clone(),
            new_conn.count_guard,
        ));
        self.connection_errors
            .push(wait_for_error(Arc::downgrade(&conn), new_conn.error_receiver).boxed());
        // Ids grow monotonically, so pushing keeps the vector sorted.
        self.conns.push(conn);
    }

    fn remove_connection(&mut self, connection: Arc<PooledConnection>, last_error: ConnectionError) {
        let Some(idx) = self
            .conns
            .iter()
            .position(|conn| Arc::ptr_eq(conn, &connection))
        else {
            trace!(
                "[{}] Connection {} was already removed",
                self.address,
                connection.id(),
            );
            return;
        };
        self.conns.remove(idx);
        connection.shutdown(last_error.to_broken());
        self.manager.recycle(connection);

        self.state = PoolState::Reconnecting;
        self.last_error = Some(last_error);
        if self.conns.is_empty() && !self.down_notified {
            self.down_notified = true;
            self.manager.notify_down(self.address);
        }
        self.update_shared_conns();
        trace!(
            "[{}] Connection removed, pool now has {}",
            self.address,
            self.conns.len(),
        );
    }

    fn close_all(&mut self) {
        debug!("[{}] Closing pool", self.address);
        let had_connections = !self.conns.is_empty();
        self.state = PoolState::Closed;
        // Drops in-flight growth attempts; their host-counter guards release
        // on drop.
        self.pending_connections = FuturesUnordered::new();
        for conn in std::mem::take(&mut self.conns) {
            conn.shutdown(BrokenConnectionError::Closing);
            self.manager.recycle(conn);
        }
        self.update_shared_conns();
        let should_notify_down = had_connections && !self.down_notified;
        self.manager.notify_closed(self.address, should_notify_down);
    }

    fn update_shared_conns(&mut self) {
        let new_conns = match self.state {
            PoolState::Closed => PoolConnections::Closed,
            PoolState::Ready | PoolState::Reconnecting => {
                if self.conns.is_empty() {
                    PoolConnections::Broken(
                        self.last_error
                            .clone()
                            .unwrap_or_else(|| BrokenConnectionError::ChannelError.into()),
                    )
                } else {
                    PoolConnections::Ready(self.conns.clone())
                }
            }
        };
        self.shared_conns.store(Arc::new(new_conns));
    }
}
