//! Helpers shared by the crate's tests: a scripted in-memory transport and a
//! listener that records every event it sees.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};

use crate::errors::ConnectionError;
use crate::network::connection::{
    Connection, ConnectionConfig, Connector, ErrorReceiver, ResponseFrame, ResponseSender,
    SerializedRequest, StreamId,
};
use crate::network::pool_manager::PoolListener;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Polls `pred` until it holds. Meant for tests running under a paused
/// clock, where the sleeps advance virtual time instead of wall time.
pub(crate) async fn eventually(mut pred: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// What the scripted connector should do with one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    /// Produce a working connection.
    Accept,
    /// Fail with "connection refused".
    Refuse,
    /// Never complete. The attempt resolves only by being cancelled.
    Pend,
}

/// A [`Connector`] whose outcomes are scripted per address: a queue of
/// one-shot behaviors, then a per-address default, then `Accept`.
/// Every connection it produces is kept in a registry so tests can break or
/// answer them.
#[derive(Default)]
pub(crate) struct MockConnector {
    scripted: StdMutex<HashMap<SocketAddr, VecDeque<ConnectBehavior>>>,
    defaults: StdMutex<HashMap<SocketAddr, ConnectBehavior>>,
    connections: StdMutex<Vec<MockConnection>>,
    connect_attempts: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `behavior` for the next `times` connect attempts to `address`.
    pub(crate) fn script(&self, address: SocketAddr, behavior: ConnectBehavior, times: usize) {
        let mut scripted = self.scripted.lock().unwrap();
        let queue = scripted.entry(address).or_default();
        for _ in 0..times {
            queue.push_back(behavior);
        }
    }

    /// Applies `behavior` to every attempt to `address` with no
    /// scripted entry.
    pub(crate) fn set_default(&self, address: SocketAddr, behavior: ConnectBehavior) {
        self.defaults.lock().unwrap().insert(address, behavior);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connections_to(&self, address: SocketAddr) -> Vec<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|conn| conn.address() == address)
            .cloned()
            .collect()
    }

    pub(crate) fn live_connections_to(&self, address: SocketAddr) -> Vec<MockConnection> {
        self.connections_to(address)
            .into_iter()
            .filter(|conn| !conn.is_closed())
            .collect()
    }

    fn next_behavior(&self, address: SocketAddr) -> ConnectBehavior {
        if let Some(behavior) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&address)
            .and_then(VecDeque::pop_front)
        {
            return behavior;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(ConnectBehavior::Accept)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn Connection>, ErrorReceiver), ConnectionError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior(address) {
            ConnectBehavior::Accept => {
                let (conn, error_receiver) = MockConnection::new(address, config);
                self.connections.lock().unwrap().push(conn.clone());
                Ok((Box::new(conn), error_receiver))
            }
            ConnectBehavior::Refuse => Err(ConnectionError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))),
            ConnectBehavior::Pend => std::future::pending().await,
        }
    }
}

struct MockConnectionInner {
    address: SocketAddr,
    keyspace: Option<String>,
    written: StdMutex<Vec<(StreamId, SerializedRequest)>>,
    responders: StdMutex<HashMap<StreamId, ResponseSender>>,
    error_sender: StdMutex<Option<oneshot::Sender<ConnectionError>>>,
    closed: AtomicBool,
}

/// The connection half of [`MockConnector`]: records every written frame and
/// lets the test answer or break it at will.
#[derive(Clone)]
pub(crate) struct MockConnection {
    inner: Arc<MockConnectionInner>,
}

impl MockConnection {
    fn new(address: SocketAddr, config: &ConnectionConfig) -> (Self, ErrorReceiver) {
        let (error_sender, error_receiver) = oneshot::channel();
        let conn = Self {
            inner: Arc::new(MockConnectionInner {
                address,
                keyspace: config.keyspace.clone(),
                written: StdMutex::new(Vec::new()),
                responders: StdMutex::new(HashMap::new()),
                error_sender: StdMutex::new(Some(error_sender)),
                closed: AtomicBool::new(false),
            }),
        };
        (conn, error_receiver)
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub(crate) fn keyspace(&self) -> Option<&str> {
        self.inner.keyspace.as_deref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> Vec<(StreamId, SerializedRequest)> {
        self.inner.written.lock().unwrap().clone()
    }

    /// Simulates the peer failing the connection.
    pub(crate) fn break_with(&self, error: ConnectionError) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(sender) = self.inner.error_sender.lock().unwrap().take() {
            let _ = sender.send(error);
        }
    }

    /// Answers the request outstanding on `stream_id`.
    pub(crate) fn respond(&self, stream_id: StreamId, frame: ResponseFrame) {
        if let Some(sender) = self.inner.responders.lock().unwrap().remove(&stream_id) {
            let _ = sender.send(Ok(frame));
        }
    }

    /// Fails the request outstanding on `stream_id`.
    pub(crate) fn fail(&self, stream_id: StreamId, error: crate::errors::RequestAttemptError) {
        if let Some(sender) = self.inner.responders.lock().unwrap().remove(&stream_id) {
            let _ = sender.send(Err(error));
        }
    }
}

impl Connection for MockConnection {
    fn connect_address(&self) -> SocketAddr {
        self.inner.address
    }

    fn max_streams(&self) -> usize {
        32768
    }

    fn write(
        &self,
        stream_id: StreamId,
        request: SerializedRequest,
        response_sender: ResponseSender,
    ) {
        self.inner.written.lock().unwrap().push((stream_id, request));
        self.inner
            .responders
            .lock()
            .unwrap()
            .insert(stream_id, response_sender);
    }

    fn close(&self) {
        self.break_with(ConnectionError::Broken(
            crate::errors::BrokenConnectionError::Closing,
        ));
    }
}

/// Every listener callback, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenerEvent {
    Up(SocketAddr),
    Down(SocketAddr),
    CriticalError(SocketAddr, String),
    Close,
}

/// A [`PoolListener`] that records events and wakes anyone waiting on them.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: StdMutex<Vec<ListenerEvent>>,
    notify: Notify,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events().iter().filter(|event| pred(event)).count()
    }

    /// Waits until the recorded event list satisfies `pred`.
    pub(crate) async fn wait_for(&self, pred: impl Fn(&[ListenerEvent]) -> bool) {
        loop {
            // Register before checking, so an event landing in between
            // cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if pred(&self.events()) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }
}

impl PoolListener for RecordingListener {
    fn on_pool_up(&self, address: SocketAddr) {
        self.record(ListenerEvent::Up(address));
    }

    fn on_pool_down(&self, address: SocketAddr) {
        self.record(ListenerEvent::Down(address));
    }

    fn on_pool_critical_error(&self, address: SocketAddr, error: ConnectionError) {
        self.record(ListenerEvent::CriticalError(address, error.to_string()));
    }

    fn on_close(&self) {
        self.record(ListenerEvent::Close);
    }
}
