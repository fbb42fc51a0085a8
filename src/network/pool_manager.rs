//! The manager that owns every per-host pool: accepts add/remove/close,
//! aggregates pool lifecycle events for its listener and drains buffered
//! writes at loop-tick boundaries.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::errors::ConnectionError;
use crate::network::connection::{Connector, PoolConfig, PooledConnection};
use crate::network::connection_pool::ConnectionPool;
use crate::network::host_counter::HostConnectionCounter;
use crate::network::pool_connector::ConnectionPoolConnector;
use crate::network::trashcan::Trashcan;

/// Receives pool lifecycle notifications. Callbacks run on the manager's
/// worker task and must not block; they may observe the manager mid-close.
/// `on_close` is the last callback ever fired.
pub trait PoolListener: Send + Sync {
    fn on_pool_up(&self, _address: SocketAddr) {}

    fn on_pool_down(&self, _address: SocketAddr) {}

    fn on_pool_critical_error(&self, _address: SocketAddr, _error: ConnectionError) {}

    fn on_close(&self) {}
}

/// Stateless sink installed whenever no listener is set, so the manager
/// never branches on listener presence.
struct NopPoolListener;

impl PoolListener for NopPoolListener {}

static NOP_POOL_LISTENER: LazyLock<Arc<NopPoolListener>> =
    LazyLock::new(|| Arc::new(NopPoolListener));

/// Upward calls from pools and pool connectors to their manager.
///
/// The sender is handed out only inside this crate, so the manager-facing
/// surface of a pool is not forgeable from user code.
#[derive(Clone)]
pub(crate) struct ManagerChannel {
    sender: mpsc::UnboundedSender<PoolEvent>,
}

impl ManagerChannel {
    // Sends ignore errors on purpose: a dropped receiver means the manager
    // worker already finished, at which point the pools are being torn down
    // and nobody is interested in their events.

    pub(crate) fn notify_up(&self, address: SocketAddr) {
        let _ = self.sender.send(PoolEvent::Up(address));
    }

    pub(crate) fn notify_down(&self, address: SocketAddr) {
        let _ = self.sender.send(PoolEvent::Down(address));
    }

    pub(crate) fn notify_closed(&self, address: SocketAddr, should_notify_down: bool) {
        let _ = self.sender.send(PoolEvent::Closed {
            address,
            should_notify_down,
        });
    }

    pub(crate) fn connector_done(
        &self,
        address: SocketAddr,
        result: Result<ConnectionPool, ConnectionError>,
    ) {
        let _ = self.sender.send(PoolEvent::ConnectorDone { address, result });
    }

    pub(crate) fn requires_flush(&self, address: SocketAddr) {
        let _ = self.sender.send(PoolEvent::RequiresFlush(address));
    }

    pub(crate) fn recycle(&self, connection: Arc<PooledConnection>) {
        let _ = self.sender.send(PoolEvent::Recycle(connection));
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

pub(crate) enum PoolEvent {
    Up(SocketAddr),
    Down(SocketAddr),
    Closed {
        address: SocketAddr,
        should_notify_down: bool,
    },
    ConnectorDone {
        address: SocketAddr,
        result: Result<ConnectionPool, ConnectionError>,
    },
    RequiresFlush(SocketAddr),
    Recycle(Arc<PooledConnection>),
}

enum ManagerCommand {
    Add(SocketAddr),
    Remove(SocketAddr),
    Close,
    SetListener(Option<Arc<dyn PoolListener>>),
    Flush,
}

/// Keeps one connection pool per added host address and multiplexes their
/// lifecycle events into a single listener.
///
/// All mutations run on a single worker task (the crate's event loop);
/// the handle's methods either post commands to it or read lock-free
/// snapshots, so every method here may be called from any thread.
pub struct ConnectionPoolManager {
    pools: Arc<ArcSwap<HashMap<SocketAddr, ConnectionPool>>>,
    pools_updated_notify: Arc<Notify>,
    keyspace: Arc<StdMutex<Option<String>>>,
    cmd_sender: mpsc::UnboundedSender<ManagerCommand>,
    _worker_handle: Arc<RemoteHandle<()>>,
}

impl ConnectionPoolManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
        keyspace: Option<String>,
    ) -> Self {
        let pools = Arc::new(ArcSwap::new(Arc::new(HashMap::new())));
        let pools_updated_notify = Arc::new(Notify::new());
        let keyspace = Arc::new(StdMutex::new(keyspace));
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let worker = ManagerWorker {
            config,
            connector,
            keyspace: keyspace.clone(),
            shared_pools: pools.clone(),
            pools_updated_notify: pools_updated_notify.clone(),
            pools: HashMap::new(),
            pending_pools: Vec::new(),
            to_flush: HashSet::new(),
            trashcan: Trashcan::new(),
            host_counter: HostConnectionCounter::default(),
            listener: NOP_POOL_LISTENER.clone(),
            close_state: CloseState::Open,
            cmd_receiver,
            cmd_closed: false,
            event_receiver,
            events: ManagerChannel {
                sender: event_sender,
            },
        };
        let (fut, worker_handle) = worker.run().remote_handle();
        tokio::spawn(fut);

        Self {
            pools,
            pools_updated_notify,
            keyspace,
            cmd_sender,
            _worker_handle: Arc::new(worker_handle),
        }
    }

    /// Starts a pool for `address`. Idempotent: a second `add` for an
    /// address with a pool or a pending connector is a no-op, as is any
    /// `add` on a closing manager.
    pub fn add(&self, address: SocketAddr) {
        let _ = self.cmd_sender.send(ManagerCommand::Add(address));
    }

    /// Initiates close of the pool for `address`; the pool unregisters
    /// itself once every connection is recycled. No-op without a pool.
    pub fn remove(&self, address: SocketAddr) {
        let _ = self.cmd_sender.send(ManagerCommand::Remove(address));
    }

    /// Initiates shutdown: closes every pool, cancels every pending
    /// connector and fires `on_close` exactly once after the last pool
    /// reports closed. Subsequent calls are no-ops.
    pub fn close(&self) {
        let _ = self.cmd_sender.send(ManagerCommand::Close);
    }

    /// Replaces the listener, atomically with respect to event delivery.
    /// `None` restores the no-op listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        let _ = self.cmd_sender.send(ManagerCommand::SetListener(listener));
    }

    /// Drains every pool that buffered writes since the last drain. Buffered
    /// writes are also drained automatically at the end of each worker-loop
    /// turn, so this is only needed to force an early write-out.
    pub fn flush(&self) {
        let _ = self.cmd_sender.send(ManagerCommand::Flush);
    }

    /// Addresses with a ready pool, in ascending order.
    pub fn available(&self) -> Vec<SocketAddr> {
        let mut addresses: Vec<SocketAddr> = self.pools.load().keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// The least busy connection of the pool for `address`, if that pool
    /// exists, is not closing, and has a connection with a free stream.
    pub fn find_least_busy(&self, address: SocketAddr) -> Option<Arc<PooledConnection>> {
        self.pools.load().get(&address)?.find_least_busy()
    }

    /// Completes the next time the set of ready pools changes. Combine with
    /// [`available`](Self::available) to await a pool coming up or
    /// going away.
    pub async fn wait_until_pools_changed(&self) {
        self.pools_updated_notify.notified().await;
    }

    /// The session-wide default keyspace, applied to connections opened from
    /// now on.
    pub fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().unwrap().clone()
    }

    pub fn set_keyspace(&self, keyspace: Option<String>) {
        *self.keyspace.lock().unwrap() = keyspace;
    }

    pub(crate) fn pool(&self, address: SocketAddr) -> Option<ConnectionPool> {
        self.pools.load().get(&address).cloned()
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    Closing,
    Closed,
}

struct PoolEntry {
    pool: ConnectionPool,
    /// Close was initiated; the entry stays here until the pool reports
    /// closed, but is hidden from the published snapshot.
    closing: bool,
    /// An `add` arrived while the pool was closing; reopen once it is gone.
    reopen: bool,
}

/// A connector for an address that has no pool yet. Dropping the handle
/// cancels the connector.
struct PendingPool {
    address: SocketAddr,
    _handle: RemoteHandle<()>,
}

struct ManagerWorker {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    keyspace: Arc<StdMutex<Option<String>>>,

    shared_pools: Arc<ArcSwap<HashMap<SocketAddr, ConnectionPool>>>,
    pools_updated_notify: Arc<Notify>,
    pools: HashMap<SocketAddr, PoolEntry>,
    pending_pools: Vec<PendingPool>,
    to_flush: HashSet<SocketAddr>,
    trashcan: Trashcan,
    host_counter: HostConnectionCounter,
    listener: Arc<dyn PoolListener>,
    close_state: CloseState,

    cmd_receiver: mpsc::UnboundedReceiver<ManagerCommand>,
    cmd_closed: bool,
    event_receiver: mpsc::UnboundedReceiver<PoolEvent>,
    /// Kept so the event channel never closes; cloned into every pool and
    /// connector as their upward capability.
    events: ManagerChannel,
}

impl ManagerWorker {
    async fn run(mut self) {
        debug!("Started connection pool manager worker");
        loop {
            // Connections recycled during the previous turn have now
            // outlived every callback of that turn; release them.
            self.trashcan.drain();

            if self.close_state == CloseState::Closed {
                debug!("Connection pool manager worker stopped");
                return;
            }

            tokio::select! {
                cmd = self.cmd_receiver.recv(), if !self.cmd_closed => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            // Every manager handle is gone; shut down.
                            self.cmd_closed = true;
                            self.handle_command(ManagerCommand::Close);
                        }
                    }
                }
                evt = self.event_receiver.recv() => {
                    if let Some(evt) = evt {
                        self.handle_event(evt);
                    }
                }
            }

            // Take whatever accumulated behind the message we just handled,
            // then write out buffered requests at the tick boundary.
            while let Ok(evt) = self.event_receiver.try_recv() {
                self.handle_event(evt);
            }
            self.flush_marked_pools();
        }
    }

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Add(address) => self.handle_add(address),
            ManagerCommand::Remove(address) => self.handle_remove(address),
            ManagerCommand::Close => self.handle_close(),
            ManagerCommand::SetListener(listener) => {
                self.listener = listener.unwrap_or_else(|| NOP_POOL_LISTENER.clone());
            }
            ManagerCommand::Flush => self.flush_marked_pools(),
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::ConnectorDone { address, result } => {
                self.handle_connector_done(address, result)
            }
            PoolEvent::Up(address) => self.listener.on_pool_up(address),
            PoolEvent::Down(address) => self.listener.on_pool_down(address),
            PoolEvent::Closed {
                address,
                should_notify_down,
            } => self.handle_pool_closed(address, should_notify_down),
            PoolEvent::RequiresFlush(address) => {
                self.to_flush.insert(address);
            }
            PoolEvent::Recycle(connection) => self.trashcan.park(connection),
        }
    }

    fn handle_add(&mut self, address: SocketAddr) {
        if self.close_state != CloseState::Open {
            return;
        }
        if let Some(entry) = self.pools.get_mut(&address) {
            if entry.closing {
                entry.reopen = true;
            }
            return;
        }
        if self.pending_pools.iter().any(|p| p.address == address) {
            return;
        }
        self.spawn_pool_connector(address);
    }

    fn spawn_pool_connector(&mut self, address: SocketAddr) {
        debug!("[{}] Opening a pool", address);
        let connector = ConnectionPoolConnector::new(
            address,
            self.config.clone(),
            self.connector.clone(),
            self.keyspace.clone(),
            self.host_counter.clone(),
            self.events.clone(),
        );
        let (fut, handle) = connector.run().remote_handle();
        tokio::spawn(fut);
        self.pending_pools.push(PendingPool {
            address,
            _handle: handle,
        });
    }

    fn handle_remove(&mut self, address: SocketAddr) {
        let Some(entry) = self.pools.get_mut(&address) else {
            return;
        };
        if entry.closing {
            return;
        }
        entry.closing = true;
        entry.pool.close();
        // Hide the pool from the read path right away; it unregisters for
        // good once it reports closed.
        self.publish_pools();
    }

    fn handle_close(&mut self) {
        if self.close_state == CloseState::Open {
            debug!("Closing connection pool manager");
            self.close_state = CloseState::Closing;
            for entry in self.pools.values_mut() {
                if !entry.closing {
                    entry.closing = true;
                    entry.pool.close();
                }
            }
            // Cancels every connector that has not completed yet.
            self.pending_pools.clear();
            self.publish_pools();
        }
        self.maybe_closed();
    }

    fn handle_connector_done(
        &mut self,
        address: SocketAddr,
        result: Result<ConnectionPool, ConnectionError>,
    ) {
        self.pending_pools.retain(|p| p.address != address);
        match result {
            Ok(pool) => {
                if self.close_state != CloseState::Open {
                    // Completed concurrently with shutdown; tear the pool
                    // down again without telling anyone it existed.
                    pool.close();
                    return;
                }
                debug!("[{}] Adding pool", address);
                // Fired before the pool is published, so a consumer that
                // observes a connection has already seen the up event.
                self.listener.on_pool_up(address);
                self.pools.insert(
                    address,
                    PoolEntry {
                        pool,
                        closing: false,
                        reopen: false,
                    },
                );
                self.publish_pools();
            }
            Err(error) => {
                if self.close_state != CloseState::Open {
                    return;
                }
                debug!("[{}] Pool failed to open: {}", address, error);
                self.listener.on_pool_critical_error(address, error);
            }
        }
    }

    fn handle_pool_closed(&mut self, address: SocketAddr, should_notify_down: bool) {
        let Some(entry) = self.pools.remove(&address) else {
            // A pool this worker no longer tracks (e.g. one that completed
            // its bring-up concurrently with shutdown).
            return;
        };
        self.to_flush.remove(&address);
        self.publish_pools();
        if should_notify_down {
            self.listener.on_pool_down(address);
        }
        if entry.reopen && self.close_state == CloseState::Open {
            self.spawn_pool_connector(address);
        }
        self.maybe_closed();
    }

    // The only site that moves closing to closed and fires on_close; callers
    // finishing work that might have been the last obstacle must end
    // with this.
    fn maybe_closed(&mut self) {
        if self.close_state == CloseState::Closing && self.pools.is_empty() {
            self.close_state = CloseState::Closed;
            debug!("Connection pool manager closed");
            self.listener.on_close();
        }
    }

    fn flush_marked_pools(&mut self) {
        for address in self.to_flush.drain() {
            if let Some(entry) = self.pools.get(&address) {
                trace!("[{}] Flushing pool", address);
                entry.pool.flush();
            }
        }
    }

    fn publish_pools(&mut self) {
        let visible: HashMap<SocketAddr, ConnectionPool> = self
            .pools
            .iter()
            .filter(|(_, entry)| !entry.closing && self.close_state == CloseState::Open)
            .map(|(address, entry)| (*address, entry.pool.clone()))
            .collect();
        self.shared_pools.store(Arc::new(visible));
        self.pools_updated_notify.notify_waiters();
    }
}
