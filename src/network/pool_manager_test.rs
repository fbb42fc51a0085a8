//! Lifecycle tests of the pool manager, driven through a scripted
//! in-memory transport.
//!
//! Every test starts with a paused clock so reconnect timing is asserted
//! against virtual time. Pausing requires the current-thread executor.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use crate::errors::{BrokenConnectionError, RequestAttemptError};
use crate::network::connection::{PoolConfig, ResponseFrame, SerializedRequest};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::utils::test_utils::{
    eventually, setup_tracing, ConnectBehavior, ListenerEvent, MockConnector, RecordingListener,
};

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 9042))
}

fn test_config() -> PoolConfig {
    PoolConfig {
        num_connections_per_host: NonZeroUsize::new(2).unwrap(),
        reconnect_wait_time: Duration::from_millis(250),
        queue_size_io: 64,
        max_streams_per_connection: 128,
        ..Default::default()
    }
}

fn new_manager(
    config: PoolConfig,
) -> (
    Arc<MockConnector>,
    Arc<ConnectionPoolManager>,
    Arc<RecordingListener>,
) {
    let connector = MockConnector::new();
    let listener = RecordingListener::new();
    let manager = Arc::new(ConnectionPoolManager::new(
        connector.clone(),
        config,
        None,
    ));
    manager.set_listener(Some(listener.clone()));
    (connector, manager, listener)
}

fn pool_size(manager: &ConnectionPoolManager, address: SocketAddr) -> usize {
    manager.pool(address).map_or(0, |pool| pool.connection_count())
}

fn request() -> SerializedRequest {
    SerializedRequest::new(Bytes::from_static(b"frame"))
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn happy_start_brings_the_pool_up() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;
    eventually(|| pool_size(&manager, a) == 2).await;

    assert_eq!(manager.available(), vec![a]);
    assert_eq!(connector.connect_attempts(), 2);

    let conn = manager.find_least_busy(a).unwrap();
    assert_eq!(conn.in_flight_count(), 0);
    // Ties are broken by the lowest connection id.
    assert_eq!(conn.id(), 0);

    assert_eq!(listener.events(), vec![ListenerEvent::Up(a)]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn all_initial_connects_failing_is_a_critical_error() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(2);
    connector.script(a, ConnectBehavior::Refuse, 2);

    manager.add(a);
    listener
        .wait_for(|events| {
            events
                .iter()
                .any(|event| matches!(event, ListenerEvent::CriticalError(address, _) if *address == a))
        })
        .await;

    assert!(manager.available().is_empty());
    assert!(manager.find_least_busy(a).is_none());
    let events = listener.events();
    assert_eq!(events.len(), 1);
    assert_matches!(
        &events[0],
        ListenerEvent::CriticalError(address, message)
            if *address == a && message.contains("connection refused")
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn losing_one_of_two_connections_recovers_without_down() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;
    eventually(|| pool_size(&manager, a) == 2).await;

    let lost_at = tokio::time::Instant::now();
    connector.live_connections_to(a)[0].break_with(BrokenConnectionError::ClosedByPeer.into());
    eventually(|| pool_size(&manager, a) == 1).await;

    eventually(|| pool_size(&manager, a) == 2).await;
    // The replacement must wait out the reconnect delay.
    assert!(lost_at.elapsed() >= Duration::from_millis(250));

    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Down(_))),
        0
    );
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Up(_))),
        1
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn losing_every_connection_notifies_down_once_and_up_on_recovery() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    eventually(|| pool_size(&manager, a) == 2).await;

    for conn in connector.live_connections_to(a) {
        conn.break_with(BrokenConnectionError::ClosedByPeer.into());
    }
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Down(a)))
        .await;
    let down_at = tokio::time::Instant::now();
    assert!(manager.find_least_busy(a).is_none());

    // Recovery: the first reconnect round succeeds and re-raises the pool.
    listener
        .wait_for(|events| events.ends_with(&[ListenerEvent::Down(a), ListenerEvent::Up(a)]))
        .await;
    assert!(down_at.elapsed() >= Duration::from_millis(250));
    eventually(|| pool_size(&manager, a) == 2).await;

    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Down(_))),
        1
    );
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Up(_))),
        2
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn single_connection_pool_retries_once_per_reconnect_wait() {
    setup_tracing();
    let config = PoolConfig {
        num_connections_per_host: NonZeroUsize::new(1).unwrap(),
        ..test_config()
    };
    let (connector, manager, listener) = new_manager(config);
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;
    let attempts_before = connector.connect_attempts();

    connector.set_default(a, ConnectBehavior::Refuse);
    connector.live_connections_to(a)[0].break_with(BrokenConnectionError::ClosedByPeer.into());
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Down(a)))
        .await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    // One failed attempt per reconnect_wait_time: at 250, 500, 750, 1000 ms.
    assert_eq!(connector.connect_attempts() - attempts_before, 4);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn closing_with_a_pending_connector_cancels_it() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);
    connector.script(a, ConnectBehavior::Pend, 2);

    manager.add(a);
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.close();

    listener
        .wait_for(|events| events.contains(&ListenerEvent::Close))
        .await;
    // The cancelled connector never completes, successfully or otherwise,
    // and nothing fires after on_close.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(listener.events(), vec![ListenerEvent::Close]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn add_is_idempotent_while_a_connector_is_pending() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;
    eventually(|| pool_size(&manager, a) == 2).await;

    // One pool, one connector, two connection attempts.
    assert_eq!(connector.connect_attempts(), 2);
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Up(_))),
        1
    );

    // Adding once more after the pool is ready changes nothing either.
    manager.add(a);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn add_remove_add_ends_with_one_pool() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    manager.remove(a);
    manager.add(a);

    listener
        .wait_for(|events| {
            events
                == &[
                    ListenerEvent::Up(a),
                    ListenerEvent::Down(a),
                    ListenerEvent::Up(a),
                ]
        })
        .await;
    eventually(|| pool_size(&manager, a) == 2).await;
    assert_eq!(manager.available(), vec![a]);
    // Two pools were brought up, two connection attempts each.
    assert_eq!(connector.connect_attempts(), 4);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn remove_without_a_pool_is_a_no_op() {
    setup_tracing();
    let (_connector, manager, listener) = new_manager(test_config());

    manager.remove(addr(9));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(listener.events().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn removed_pool_disappears_from_the_read_path() {
    setup_tracing();
    let (_connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    manager.remove(a);
    while !manager.available().is_empty() {
        manager.wait_until_pools_changed().await;
    }
    assert!(manager.find_least_busy(a).is_none());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn close_fires_on_close_exactly_once_after_every_pool_event() {
    setup_tracing();
    let (_connector, manager, listener) = new_manager(test_config());
    let a = addr(1);
    let b = addr(2);

    manager.add(a);
    manager.add(b);
    listener
        .wait_for(|events| {
            events.contains(&ListenerEvent::Up(a)) && events.contains(&ListenerEvent::Up(b))
        })
        .await;

    manager.close();
    manager.close();
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Close))
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let events = listener.events();
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Close)),
        1
    );
    assert_eq!(events.last(), Some(&ListenerEvent::Close));
    assert!(manager.available().is_empty());
    assert!(manager.find_least_busy(a).is_none());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn operations_on_a_closed_manager_are_accepted_no_ops() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());

    manager.close();
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Close))
        .await;

    manager.add(addr(1));
    manager.remove(addr(1));
    manager.flush();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_attempts(), 0);
    assert_eq!(listener.events(), vec![ListenerEvent::Close]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn keyspace_roundtrips_and_reaches_new_connections() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.set_keyspace(Some("first_ks".to_owned()));
    assert_eq!(manager.keyspace().as_deref(), Some("first_ks"));

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;
    eventually(|| pool_size(&manager, a) == 2).await;
    for conn in connector.connections_to(a) {
        assert_eq!(conn.keyspace(), Some("first_ks"));
    }

    // Connections opened after a keyspace change carry the new one.
    manager.set_keyspace(Some("second_ks".to_owned()));
    connector.live_connections_to(a)[0].break_with(BrokenConnectionError::ClosedByPeer.into());
    eventually(|| connector.connections_to(a).len() == 3).await;
    assert_eq!(
        connector.connections_to(a)[2].keyspace(),
        Some("second_ks")
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn buffered_writes_reach_the_transport_at_the_tick_boundary() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    let conn = manager.find_least_busy(a).unwrap();
    let pending = conn.send_request(request()).unwrap();
    assert_eq!(conn.in_flight_count(), 1);

    // No explicit flush: the manager drains its flush set at the end of the
    // worker-loop turn that saw the write.
    eventually(|| {
        connector
            .live_connections_to(a)
            .iter()
            .any(|mock_conn| !mock_conn.written().is_empty())
    })
    .await;

    let written_on = connector
        .live_connections_to(a)
        .into_iter()
        .find(|mock_conn| !mock_conn.written().is_empty())
        .unwrap();
    let (stream_id, _frame) = written_on.written()[0].clone();
    assert_eq!(stream_id, pending.stream_id());

    written_on.respond(stream_id, ResponseFrame::new(Bytes::from_static(b"ok")));
    let response = pending.response().await.unwrap();
    assert_eq!(response.data(), b"ok");
    assert_eq!(conn.in_flight_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn error_threshold_tears_down_and_replaces_the_connection() {
    setup_tracing();
    let config = PoolConfig {
        num_connections_per_host: NonZeroUsize::new(1).unwrap(),
        connection_error_threshold: 2,
        ..test_config()
    };
    let (connector, manager, listener) = new_manager(config);
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    for round in 0..2usize {
        let conn = manager.find_least_busy(a).unwrap();
        let pending = conn.send_request(request()).unwrap();
        let stream_id = pending.stream_id();
        eventually(|| connector.connections_to(a)[0].written().len() > round).await;
        connector.connections_to(a)[0]
            .fail(stream_id, BrokenConnectionError::ClosedByPeer.into());
        assert_matches!(
            pending.response().await,
            Err(RequestAttemptError::BrokenConnection(_))
        );
    }

    // The poisoned connection is gone and a replacement comes up after the
    // reconnect delay.
    eventually(|| connector.connections_to(a).len() == 2).await;
    eventually(|| pool_size(&manager, a) == 1).await;
    assert!(connector.connections_to(a)[0].is_closed());
    assert!(!connector.connections_to(a)[1].is_closed());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_pool_gives_up_after_the_reconnect_limit() {
    setup_tracing();
    let config = PoolConfig {
        num_connections_per_host: NonZeroUsize::new(1).unwrap(),
        max_reconnect_attempts: NonZeroUsize::new(2),
        ..test_config()
    };
    let (connector, manager, listener) = new_manager(config);
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    connector.set_default(a, ConnectBehavior::Refuse);
    connector.live_connections_to(a)[0].break_with(BrokenConnectionError::ClosedByPeer.into());
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Down(a)))
        .await;

    // Two failed rounds later the pool unregisters itself.
    eventually(|| manager.pool(a).is_none()).await;
    assert!(manager.available().is_empty());
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Down(_))),
        1
    );

    // The address can be added again from scratch.
    connector.set_default(a, ConnectBehavior::Accept);
    manager.add(a);
    listener
        .wait_for(|events| {
            events
                .iter()
                .filter(|event| matches!(event, ListenerEvent::Up(_)))
                .count()
                == 2
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn explicit_flush_drains_marked_pools() {
    setup_tracing();
    let (connector, manager, listener) = new_manager(test_config());
    let a = addr(1);

    manager.add(a);
    listener
        .wait_for(|events| events.contains(&ListenerEvent::Up(a)))
        .await;

    let conn = manager.find_least_busy(a).unwrap();
    let _pending = conn.send_request(request()).unwrap();
    manager.flush();
    eventually(|| {
        connector
            .live_connections_to(a)
            .iter()
            .any(|mock_conn| !mock_conn.written().is_empty())
    })
    .await;
}
