//! The transport seam and the pooled connection wrapper.
//!
//! Everything below [`Connection`] (framing, codecs, TLS, authentication,
//! protocol negotiation) is somebody else's problem: the pool consumes ready
//! connections produced by a [`Connector`] and only concerns itself with
//! stream multiplexing, in-flight accounting and write batching.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::errors::{BrokenConnectionError, ConnectionError, RequestAttemptError};
use crate::network::host_counter::HostConnectionGuard;
use crate::network::pool_manager::ManagerChannel;

/// Protocol-level stream id multiplexing concurrent requests on
/// one connection.
pub type StreamId = i16;

/// Identifier of a connection, stable within its pool instance. Assigned in
/// increasing order, which makes pool iteration deterministic and provides
/// the least-busy tie-break.
pub type ConnectionId = u64;

/// An already-serialized request frame, forwarded to the transport verbatim.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Bytes,
}

impl SerializedRequest {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// An undecoded response frame handed back by the transport. Decoding
/// happens above this crate.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    data: Bytes,
}

impl ResponseFrame {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Channel through which the transport delivers the response (or the failure)
/// of a single request attempt.
pub type ResponseSender = oneshot::Sender<Result<ResponseFrame, RequestAttemptError>>;

/// Resolves exactly once, when the transport declares the connection broken.
/// This is the connection's `on_close` notification.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// A single live channel to a server, implemented by the transport layer.
///
/// Implementations must release the underlying transport resources when the
/// last handle is dropped, and must resolve the [`ErrorReceiver`] paired with
/// the connection exactly once, whether the connection was closed locally or
/// by the peer.
pub trait Connection: Send + Sync {
    /// The address this connection is established to.
    fn connect_address(&self) -> SocketAddr;

    /// Upper bound on concurrently outstanding streams the transport
    /// supports, as negotiated with the protocol version.
    fn max_streams(&self) -> usize;

    /// Hands a frame to the transport for delivery on `stream_id`.
    /// The response, or the failure, is reported through `response_sender`.
    fn write(
        &self,
        stream_id: StreamId,
        request: SerializedRequest,
        response_sender: ResponseSender,
    );

    /// Initiates transport shutdown. The paired [`ErrorReceiver`] resolves
    /// once the connection is fully closed.
    fn close(&self);
}

/// Opens connections. The pool never dials sockets itself; it asks
/// the connector and receives a ready [`Connection`] together with its
/// error channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn Connection>, ErrorReceiver), ConnectionError>;
}

/// Settings forwarded to the [`Connector`] for every connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    /// Keyspace the connection should start in. Filled in from the manager's
    /// current keyspace at the moment the attempt is started.
    pub keyspace: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            keyspace: None,
        }
    }
}

/// Settings of a [`ConnectionPoolManager`](crate::ConnectionPoolManager) and
/// every pool it creates.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Settings forwarded to the transport [`Connector`].
    pub connection_config: ConnectionConfig,

    /// Target number of live connections per host.
    pub num_connections_per_host: NonZeroUsize,

    /// Delay before a pool retries a lost connection.
    pub reconnect_wait_time: Duration,

    /// Bound on the per-connection pending-write queue.
    pub queue_size_io: usize,

    /// Upper bound on concurrent streams per connection. The effective limit
    /// is the minimum of this and what the transport negotiated.
    pub max_streams_per_connection: usize,

    /// How many consecutive failed reconnect rounds an empty pool tolerates
    /// before closing itself. `None` retries forever.
    pub max_reconnect_attempts: Option<NonZeroUsize>,

    /// Request-error count after which a connection is torn down
    /// and replaced.
    pub connection_error_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            num_connections_per_host: NonZeroUsize::new(1).unwrap(),
            reconnect_wait_time: Duration::from_secs(2),
            queue_size_io: 8192,
            max_streams_per_connection: 32768,
            max_reconnect_attempts: None,
            connection_error_threshold: 8,
        }
    }
}

/// A write buffered on a [`PooledConnection`], waiting for the next flush.
struct PendingWrite {
    stream_id: StreamId,
    request: SerializedRequest,
    response_sender: ResponseSender,
}

/// A [`Connection`] owned by a pool, extended with the state the pool and the
/// dispatcher need: a stream-id free list, an in-flight counter, a bounded
/// pending-write queue and an error counter.
pub struct PooledConnection {
    id: ConnectionId,
    conn: Box<dyn Connection>,
    address: SocketAddr,
    max_streams: usize,
    streams: StdMutex<StreamIdSet>,
    in_flight: AtomicUsize,
    pending_writes: StdMutex<VecDeque<PendingWrite>>,
    queue_size_io: usize,
    flush_requested: AtomicBool,
    errors: AtomicUsize,
    error_threshold: usize,
    closing: AtomicBool,
    manager: ManagerChannel,
    // Held so the per-host connection count drops when the connection is
    // finally released, wherever that happens.
    _count_guard: HostConnectionGuard,
}

impl PooledConnection {
    pub(crate) fn new(
        id: ConnectionId,
        conn: Box<dyn Connection>,
        address: SocketAddr,
        config: &PoolConfig,
        manager: ManagerChannel,
        count_guard: HostConnectionGuard,
    ) -> Self {
        let max_streams = config.max_streams_per_connection.min(conn.max_streams());
        Self {
            id,
            conn,
            address,
            max_streams,
            streams: StdMutex::new(StreamIdSet::new(max_streams)),
            in_flight: AtomicUsize::new(0),
            pending_writes: StdMutex::new(VecDeque::new()),
            queue_size_io: config.queue_size_io,
            flush_requested: AtomicBool::new(false),
            errors: AtomicUsize::new(0),
            error_threshold: config.connection_error_threshold,
            closing: AtomicBool::new(false),
            manager,
            _count_guard: count_guard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of reserved, not-yet-completed streams.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of stream ids currently free on this connection.
    pub fn available_stream_count(&self) -> usize {
        self.max_streams.saturating_sub(self.in_flight_count())
    }

    /// True if at least one stream id is free and the connection still
    /// accepts requests.
    pub fn has_free_stream(&self) -> bool {
        !self.is_closing() && self.available_stream_count() > 0
    }

    /// Reserves a stream id. The returned guard releases it on drop.
    fn reserve_stream(self: &Arc<Self>) -> Option<StreamGuard> {
        if self.is_closing() {
            return None;
        }
        let stream_id = self.streams.lock().unwrap().allocate()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        trace!(
            "[{}] Reserved stream {} on connection {}",
            self.address,
            stream_id,
            self.id,
        );
        Some(StreamGuard {
            conn: self.clone(),
            stream_id,
        })
    }

    /// Reserves a stream and buffers the request for the next flush.
    ///
    /// The write reaches the transport when the pool is flushed, which the
    /// manager does at the end of the event-loop turn in which this
    /// was called.
    pub fn send_request(
        self: &Arc<Self>,
        request: SerializedRequest,
    ) -> Result<PendingRequest, RequestAttemptError> {
        if self.is_closing() {
            return Err(BrokenConnectionError::Closing.into());
        }
        let guard = self
            .reserve_stream()
            .ok_or(RequestAttemptError::UnableToAllocStreamId)?;
        let (response_sender, response_receiver) = oneshot::channel();

        {
            let mut queue = self.pending_writes.lock().unwrap();
            if queue.len() >= self.queue_size_io {
                return Err(RequestAttemptError::WriteQueueFull);
            }
            queue.push_back(PendingWrite {
                stream_id: guard.stream_id,
                request,
                response_sender,
            });
        }
        // A concurrent shutdown may have drained the queue between the
        // closing check and the push; abandon anything it left behind.
        if self.is_closing() {
            self.abandon_pending_writes(BrokenConnectionError::Closing);
        }
        self.request_flush();

        Ok(PendingRequest {
            guard,
            response_receiver,
        })
    }

    /// Writes out every buffered request. Invoked by the manager when this
    /// connection's pool is drained from the flush set.
    pub(crate) fn flush(&self) {
        self.flush_requested.store(false, Ordering::Release);
        loop {
            let write = self.pending_writes.lock().unwrap().pop_front();
            let Some(write) = write else { break };
            if self.is_closing() {
                let _ = write
                    .response_sender
                    .send(Err(BrokenConnectionError::Closing.into()));
                continue;
            }
            trace!(
                "[{}] Flushing stream {} on connection {}",
                self.address,
                write.stream_id,
                self.id,
            );
            self.conn
                .write(write.stream_id, write.request, write.response_sender);
        }
    }

    /// Marks the connection dead, fails buffered writes and closes
    /// the transport. Idempotent.
    pub(crate) fn shutdown(&self, reason: BrokenConnectionError) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abandon_pending_writes(reason);
        self.conn.close();
    }

    /// Records a request error against this connection. Errors are
    /// observational until the threshold is crossed, at which point the
    /// connection is closed so that its pool replaces it.
    pub(crate) fn record_request_error(&self) {
        let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        if errors >= self.error_threshold && !self.closing.swap(true, Ordering::AcqRel) {
            warn!(
                "[{}] Connection {} exceeded the error threshold ({}), closing",
                self.address, self.id, self.error_threshold,
            );
            self.abandon_pending_writes(BrokenConnectionError::TooManyErrors);
            self.conn.close();
        }
    }

    pub(crate) fn error_count(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }

    fn abandon_pending_writes(&self, reason: BrokenConnectionError) {
        let abandoned: Vec<PendingWrite> =
            self.pending_writes.lock().unwrap().drain(..).collect();
        for write in abandoned {
            let _ = write.response_sender.send(Err(reason.clone().into()));
        }
    }

    fn request_flush(&self) {
        if !self.flush_requested.swap(true, Ordering::AcqRel) {
            self.manager.requires_flush(self.address);
        }
    }

    fn release_stream(&self, stream_id: StreamId) {
        self.streams.lock().unwrap().free(stream_id);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("in_flight", &self.in_flight_count())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

/// Holds a reserved stream id; releasing happens on drop, so the in-flight
/// count always equals the number of outstanding guards.
struct StreamGuard {
    conn: Arc<PooledConnection>,
    stream_id: StreamId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.conn.release_stream(self.stream_id);
    }
}

/// A request that was written (or buffered for write) on a connection.
/// Await [`PendingRequest::response`] to get the outcome; dropping it instead
/// releases the stream and leaves any late response to the transport.
pub struct PendingRequest {
    guard: StreamGuard,
    response_receiver: oneshot::Receiver<Result<ResponseFrame, RequestAttemptError>>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("stream_id", &self.guard.stream_id)
            .finish()
    }
}

impl PendingRequest {
    /// The stream id this request occupies on its connection.
    pub fn stream_id(&self) -> StreamId {
        self.guard.stream_id
    }

    /// The connection the request was placed on.
    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.guard.conn
    }

    /// Waits for the response. Failures are recorded into the connection's
    /// error counter; the reserved stream is released either way.
    pub async fn response(self) -> Result<ResponseFrame, RequestAttemptError> {
        let PendingRequest {
            guard,
            response_receiver,
        } = self;
        let result = match response_receiver.await {
            Ok(result) => result,
            Err(_) => Err(BrokenConnectionError::ChannelError.into()),
        };
        if result.is_err() {
            guard.conn.record_request_error();
        }
        result
    }
}

/// Free list of stream ids, kept as a bitmap. Allocation returns the lowest
/// free id.
pub(crate) struct StreamIdSet {
    used_bitmap: Vec<u64>,
    max_streams: usize,
}

impl StreamIdSet {
    pub(crate) fn new(max_streams: usize) -> Self {
        // Stream ids are i16 on the wire; anything above is unaddressable.
        let max_streams = max_streams.min(i16::MAX as usize + 1);
        let words = max_streams.div_ceil(64);
        Self {
            used_bitmap: vec![0; words],
            max_streams,
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<StreamId> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                let stream_id = block_id as u64 * 64 + off as u64;
                if stream_id >= self.max_streams as u64 {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as StreamId);
            }
        }
        None
    }

    pub(crate) fn free(&mut self, stream_id: StreamId) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1u64 << off);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::{
        Connection, PoolConfig, PooledConnection, ResponseSender, SerializedRequest, StreamId,
        StreamIdSet,
    };
    use crate::errors::RequestAttemptError;
    use crate::network::host_counter::HostConnectionCounter;
    use crate::network::pool_manager::ManagerChannel;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn stream_id_set_allocates_lowest_free_id() {
        setup_tracing();
        let mut set = StreamIdSet::new(4);
        assert_eq!(set.allocate(), Some(0));
        assert_eq!(set.allocate(), Some(1));
        assert_eq!(set.allocate(), Some(2));
        set.free(1);
        assert_eq!(set.allocate(), Some(1));
        assert_eq!(set.allocate(), Some(3));
        assert_eq!(set.allocate(), None);
        set.free(2);
        assert_eq!(set.allocate(), Some(2));
    }

    #[test]
    fn stream_id_set_handles_whole_blocks() {
        setup_tracing();
        let mut set = StreamIdSet::new(130);
        for expected in 0..130 {
            assert_eq!(set.allocate(), Some(expected as StreamId));
        }
        assert_eq!(set.allocate(), None);
        set.free(64);
        assert_eq!(set.allocate(), Some(64));
    }

    // A transport stub that only counts; the full-featured mock lives in
    // utils::test_utils.
    struct CountingConnection {
        address: std::net::SocketAddr,
        writes: StdMutex<Vec<StreamId>>,
        closed: AtomicBool,
    }

    impl Connection for Arc<CountingConnection> {
        fn connect_address(&self) -> std::net::SocketAddr {
            self.address
        }

        fn max_streams(&self) -> usize {
            32768
        }

        fn write(
            &self,
            stream_id: StreamId,
            _request: SerializedRequest,
            _response_sender: ResponseSender,
        ) {
            self.writes.lock().unwrap().push(stream_id);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn pooled(config: &PoolConfig) -> (Arc<PooledConnection>, Arc<CountingConnection>) {
        let address = "10.0.0.1:9042".parse().unwrap();
        let transport = Arc::new(CountingConnection {
            address,
            writes: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let (manager, _events) = ManagerChannel::new_for_tests();
        let counter = HostConnectionCounter::default();
        let guard = counter.try_increase(address, 1).unwrap();
        let conn = Arc::new(PooledConnection::new(
            0,
            Box::new(transport.clone()),
            address,
            config,
            manager,
            guard,
        ));
        (conn, transport)
    }

    fn request() -> SerializedRequest {
        SerializedRequest::new(Bytes::from_static(b"frame"))
    }

    #[tokio::test]
    async fn reservations_fail_exactly_at_max_streams() {
        setup_tracing();
        let config = PoolConfig {
            max_streams_per_connection: 2,
            ..Default::default()
        };
        let (conn, _transport) = pooled(&config);

        let first = conn.send_request(request()).unwrap();
        assert_eq!(conn.in_flight_count(), 1);
        assert!(conn.has_free_stream());

        let second = conn.send_request(request()).unwrap();
        assert_eq!(conn.in_flight_count(), 2);
        assert!(!conn.has_free_stream());

        assert_matches!(
            conn.send_request(request()),
            Err(RequestAttemptError::UnableToAllocStreamId)
        );

        // Dropping a pending request releases its stream.
        drop(first);
        assert_eq!(conn.in_flight_count(), 1);
        assert!(conn.has_free_stream());
        let _third = conn.send_request(request()).unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn writes_are_buffered_until_flush_in_submission_order() {
        setup_tracing();
        let config = PoolConfig::default();
        let (conn, transport) = pooled(&config);

        let _first = conn.send_request(request()).unwrap();
        let _second = conn.send_request(request()).unwrap();
        assert!(transport.writes.lock().unwrap().is_empty());

        conn.flush();
        assert_eq!(*transport.writes.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn full_write_queue_rejects_and_releases_the_stream() {
        setup_tracing();
        let config = PoolConfig {
            queue_size_io: 1,
            ..Default::default()
        };
        let (conn, _transport) = pooled(&config);

        let _first = conn.send_request(request()).unwrap();
        assert_matches!(
            conn.send_request(request()),
            Err(RequestAttemptError::WriteQueueFull)
        );
        // The failed attempt must not leak its reservation.
        assert_eq!(conn.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn error_threshold_closes_the_connection() {
        setup_tracing();
        let config = PoolConfig {
            connection_error_threshold: 2,
            ..Default::default()
        };
        let (conn, transport) = pooled(&config);

        conn.record_request_error();
        assert!(!conn.is_closing());
        assert_eq!(conn.error_count(), 1);
        conn.record_request_error();
        assert!(conn.is_closing());
        assert!(transport.closed.load(Ordering::SeqCst));
        assert_matches!(
            conn.send_request(request()),
            Err(RequestAttemptError::BrokenConnection(_))
        );
    }
}
