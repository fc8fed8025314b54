use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::health;
use super::slot::lock_or_recover;
use super::*;
use crate::error::Error;
use crate::event::{EventStream, PoolEvent};
use crate::network;
use crate::testkit;
use crate::testkit::transport::{tracked_factory, ScriptedTransport};
use crate::transport::{TransportEvent, TransportFactory};

// -- Helpers --------------------------------------------------------------

fn pool_with(factory: TransportFactory) -> ConnectionPool {
    ConnectionPool::new(testkit::config::pool(), factory, network::always_available()).unwrap()
}

/// Wait for an event matching `pred`, skipping others, with a 2s guard.
async fn expect_event(
    stream: &mut EventStream,
    pred: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = stream.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Factory whose first transport closes uncleanly after connecting; every
/// later transport refuses to connect. All share one connect counter.
fn failing_reconnect_factory(connect_count: Arc<AtomicU32>) -> TransportFactory {
    let created = Arc::new(AtomicU32::new(0));
    Arc::new(move |_url| {
        let nth = created.fetch_add(1, Ordering::SeqCst);
        let mut transport = if nth == 0 {
            ScriptedTransport::new().with_events(vec![Some(TransportEvent::Closed {
                clean: false,
                reason: "connection reset".to_string(),
            })])
        } else {
            ScriptedTransport::new()
                .with_connect_results(vec![Err(Error::Transport("refused".to_string()))])
        };
        transport.set_connect_count(connect_count.clone());
        Box::new(transport)
    })
}

// -- Add / remove ---------------------------------------------------------

#[tokio::test]
async fn add_connection_opens_and_registers() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();

    pool.add_connection("a", "wss://backend/a").await.unwrap();

    let info = pool.connection(&"a".into()).unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    assert_eq!(info.url, "wss://backend/a");
    assert_eq!(handles.lock().unwrap()[0].connect_count(), 1);

    assert!(matches!(
        events.try_recv(),
        Some(PoolEvent::ConnectionAdded { .. })
    ));
    assert!(matches!(
        events.try_recv(),
        Some(PoolEvent::ConnectionOpened { .. })
    ));
}

#[tokio::test]
async fn add_rejects_duplicates_and_enforces_capacity() {
    let (factory, _handles) = tracked_factory();
    let mut config = testkit::config::pool();
    config.max_connections = 1;
    let pool = ConnectionPool::new(config, factory, network::always_available()).unwrap();

    pool.add_connection("a", "wss://backend/a").await.unwrap();
    assert!(matches!(
        pool.add_connection("a", "wss://backend/a").await,
        Err(Error::DuplicateConnection(_))
    ));
    assert!(matches!(
        pool.add_connection("b", "wss://backend/b").await,
        Err(Error::PoolExhausted { max: 1 })
    ));
}

#[tokio::test]
async fn add_surfaces_connect_failure_and_rolls_back() {
    let factory: TransportFactory = Arc::new(|_url| {
        Box::new(
            ScriptedTransport::new()
                .with_connect_results(vec![Err(Error::Transport("refused".to_string()))]),
        )
    });
    let pool = pool_with(factory);

    assert!(pool.add_connection("a", "wss://backend/a").await.is_err());
    assert!(pool.connections().is_empty());
}

#[tokio::test]
async fn add_times_out_slow_handshakes() {
    let factory: TransportFactory = Arc::new(|_url| {
        Box::new(ScriptedTransport::new().with_connect_delay(Duration::from_secs(10)))
    });
    let mut config = testkit::config::pool();
    config.connection_timeout_ms = 20;
    let pool = ConnectionPool::new(config, factory, network::always_available()).unwrap();

    assert!(matches!(
        pool.add_connection("a", "wss://backend/a").await,
        Err(Error::ConnectTimeout { timeout_ms: 20 })
    ));
    assert!(pool.connections().is_empty());
}

#[tokio::test]
async fn remove_connection_is_idempotent() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    assert!(pool.remove_connection(&"a".into()));
    assert!(!pool.remove_connection(&"a".into()));
    assert!(pool.connection(&"a".into()).is_none());

    // The actor closes its transport cleanly rather than being aborted.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handles.lock().unwrap()[0].close_count(), 1);
}

// -- Sending --------------------------------------------------------------

#[tokio::test]
async fn send_transmits_with_injected_timestamp() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    let outcome = pool.send(json!({ "type": "chat", "body": "hi" }), 5).await;
    assert_eq!(outcome, SendOutcome::Sent);

    let sent = handles.lock().unwrap()[0].sent_json();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "chat");
    assert!(sent[0]["timestamp"].is_u64());
}

#[tokio::test]
async fn send_without_connections_queues() {
    let (factory, _handles) = tracked_factory();
    let pool = pool_with(factory);

    let outcome = pool.send(json!({ "n": 1 }), 1).await;
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(pool.statistics().queued_messages, 1);
    // The balancer was consulted and found nothing.
    assert_eq!(pool.ctx.balancer.selection_count(), 1);
}

#[tokio::test]
async fn network_down_queues_without_consulting_balancer() {
    let (factory, handles) = tracked_factory();
    let (_network, rx) = network::channel(false);
    let pool = ConnectionPool::new(testkit::config::pool(), factory, rx).unwrap();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    let outcome = pool.send(json!({ "n": 1 }), 1).await;
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(pool.ctx.balancer.selection_count(), 0);
    assert_eq!(pool.statistics().queued_messages, 1);
    assert!(handles.lock().unwrap()[0].sent_frames().is_empty());
}

#[tokio::test]
async fn failed_transmission_falls_back_to_queue() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    pool.add_connection("a", "wss://backend/a").await.unwrap();
    handles.lock().unwrap()[0].set_fail_sends(true);

    let outcome = pool.send(json!({ "n": 1 }), 1).await;
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(pool.statistics().queued_messages, 1);
}

#[tokio::test]
async fn send_to_connection_bypasses_balancer_and_checks_state() {
    let (factory, handles) = tracked_factory();
    let mut config = testkit::config::pool();
    config.enable_failover = false;
    let pool = ConnectionPool::new(config, factory, network::always_available()).unwrap();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    pool.send_to_connection(&"a".into(), json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(handles.lock().unwrap()[0].send_count(), 1);

    assert!(matches!(
        pool.send_to_connection(&"ghost".into(), json!({})).await,
        Err(Error::UnknownConnection(_))
    ));

    // Disconnect the transport; targeted sends now fail instead of queueing.
    let mut events = pool.subscribe();
    handles.lock().unwrap()[0].close(false, "gone");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;
    assert!(matches!(
        pool.send_to_connection(&"a".into(), json!({})).await,
        Err(Error::NotConnected(_))
    ));
    assert_eq!(pool.statistics().queued_messages, 0);
}

// -- Failover -------------------------------------------------------------

#[tokio::test]
async fn unclean_close_reconnects_and_drains_queue() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    handles.lock().unwrap()[0].close(false, "connection reset");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;

    // Buffer a message; the successful reconnection must drain it.
    pool.send(json!({ "type": "hello" }), 1).await;

    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionReconnected { .. })
    })
    .await;
    let info = pool.connection(&"a".into()).unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    assert_eq!(info.reconnect_attempts, 0);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let replacement = handles.lock().unwrap().get(1).cloned();
            if let Some(replacement) = replacement {
                if replacement.sent_json().iter().any(|m| m["type"] == "hello") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued message never reached the replacement transport");
    assert_eq!(pool.statistics().total_reconnects, 1);
}

#[tokio::test]
async fn retry_ceiling_emits_connection_failed() {
    let connect_count = Arc::new(AtomicU32::new(0));
    let factory = failing_reconnect_factory(connect_count.clone());
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    let failed = expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionFailed { .. })
    })
    .await;
    let PoolEvent::ConnectionFailed { attempts, .. } = failed else {
        unreachable!()
    };
    assert_eq!(attempts, 3);
    // Initial open plus three failed reattempts.
    assert_eq!(connect_count.load(Ordering::SeqCst), 4);

    // The slot stays down until the application intervenes.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connect_count.load(Ordering::SeqCst), 4);
    assert_eq!(
        pool.connection(&"a".into()).unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn removal_cancels_pending_reconnect_timer() {
    let (factory, handles) = tracked_factory();
    let mut config = testkit::config::pool();
    config.reconnect_delay_ms = 40;
    config.reconnect_delay_max_ms = 160;
    let pool = ConnectionPool::new(config, factory, network::always_available()).unwrap();
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    handles.lock().unwrap()[0].close(false, "connection reset");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;

    // Remove while the backoff timer is still pending, then wait past its
    // original fire time.
    assert!(pool.remove_connection(&"a".into()));
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(handles.lock().unwrap().len(), 1, "zombie timer reconnected");
    assert!(pool.connection(&"a".into()).is_none());
    while let Some(event) = events.try_recv() {
        assert!(
            !matches!(event, PoolEvent::ConnectionReconnected { .. }),
            "reconnection side effect after removal"
        );
    }
}

#[tokio::test]
async fn clean_close_does_not_reconnect() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    handles.lock().unwrap()[0].close(true, "bye");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(handles.lock().unwrap().len(), 1);
    assert_eq!(
        pool.connection(&"a".into()).unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn failover_disabled_leaves_slot_down() {
    let (factory, handles) = tracked_factory();
    let mut config = testkit::config::pool();
    config.enable_failover = false;
    let pool = ConnectionPool::new(config, factory, network::always_available()).unwrap();
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    handles.lock().unwrap()[0].close(false, "connection reset");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(handles.lock().unwrap().len(), 1);
    assert_eq!(
        pool.connection(&"a".into()).unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn transport_error_marks_slot_without_closing() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    handles.lock().unwrap()[0].error("tls hiccup");
    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionError { .. })
    })
    .await;

    let info = pool.connection(&"a".into()).unwrap();
    assert_eq!(info.state, ConnectionState::Error);
    assert_eq!(info.metrics.error_count, 1);
    // No close signal was delivered, so no replacement was spawned.
    assert_eq!(handles.lock().unwrap().len(), 1);
}

// -- Health sweep ---------------------------------------------------------

#[tokio::test]
async fn sweep_pings_stale_connections() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    // Backdate activity far beyond the 2x-interval staleness cutoff.
    let id = ConnectionId::from("a");
    {
        let connections = lock_or_recover(&pool.ctx.connections);
        let slot = connections.get(&id).unwrap();
        slot.shared.last_activity.store(0, Ordering::Relaxed);
    }
    health::sweep(&pool.ctx);

    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::HealthCheckCompleted { connections: 1, connected: 1, .. })
    })
    .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let sent = handles.lock().unwrap()[0].sent_json();
            if sent.iter().any(|m| m["type"] == "ping") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stale connection was never probed");

    // A stale-but-alive connection is probed, not reconnected.
    assert_eq!(handles.lock().unwrap().len(), 1);
    assert_eq!(
        pool.connection(&"a".into()).unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn sweep_hands_dead_actors_to_reconnection() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    let id = ConnectionId::from("a");
    {
        let connections = lock_or_recover(&pool.ctx.connections);
        let slot = connections.get(&id).unwrap();
        slot.actor.as_ref().unwrap().abort();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    health::sweep(&pool.ctx);

    expect_event(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionReconnected { .. })
    })
    .await;
    assert_eq!(handles.lock().unwrap().len(), 2);
    assert_eq!(
        pool.connection(&"a".into()).unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn sweep_resets_per_interval_message_rate() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();

    for n in 0..3 {
        handles.lock().unwrap()[0].frame(json!({ "n": n }));
    }
    for _ in 0..3 {
        expect_event(&mut events, |e| matches!(e, PoolEvent::Message { .. })).await;
    }
    assert_eq!(
        pool.connection(&"a".into())
            .unwrap()
            .metrics
            .messages_per_second,
        3
    );

    health::sweep(&pool.ctx);
    assert_eq!(
        pool.connection(&"a".into())
            .unwrap()
            .metrics
            .messages_per_second,
        0
    );
}

// -- Config / stats / teardown --------------------------------------------

#[tokio::test]
async fn update_config_changes_strategy_for_next_selection() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    pool.add_connection("a", "wss://backend/a").await.unwrap();
    pool.add_connection("b", "wss://backend/b").await.unwrap();

    // Equal latencies: least-latency resolves ties by creation order, so
    // every pick lands on "a" — unlike the round-robin default, which would
    // alternate.
    pool.update_config(PoolConfigUpdate {
        load_balancing_strategy: Some(crate::balancer::LoadBalancingStrategy::LeastLatency),
        ..PoolConfigUpdate::default()
    })
    .unwrap();

    pool.send(json!({ "n": 0 }), 1).await;
    pool.send(json!({ "n": 1 }), 1).await;
    let handles = handles.lock().unwrap();
    assert_eq!(handles[0].send_count(), 2);
    assert_eq!(handles[1].send_count(), 0);
}

#[tokio::test]
async fn update_config_rejects_invalid_values() {
    let (factory, _handles) = tracked_factory();
    let pool = pool_with(factory);

    let result = pool.update_config(PoolConfigUpdate {
        max_connections: Some(0),
        ..PoolConfigUpdate::default()
    });
    assert!(result.is_err());
    // The previous configuration is untouched.
    assert_eq!(pool.config().max_connections, 8);
}

#[tokio::test]
async fn statistics_snapshot_reflects_pool_state() {
    let (factory, handles) = tracked_factory();
    let pool = pool_with(factory);
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();
    pool.add_connection("b", "wss://backend/b").await.unwrap();

    handles.lock().unwrap()[0].frame(json!({ "n": 0 }));
    expect_event(&mut events, |e| matches!(e, PoolEvent::Message { .. })).await;
    pool.send(json!({ "n": 1 }), 1).await;

    let stats = pool.statistics();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert!(stats.total_bytes_transferred > 0);
    assert!(stats.network_available);
    assert_eq!(stats.queued_messages, 0);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_clears_state() {
    let (factory, handles) = tracked_factory();
    let (_network, rx) = network::channel(false);
    let pool = ConnectionPool::new(testkit::config::pool(), factory, rx).unwrap();
    let mut events = pool.subscribe();
    pool.add_connection("a", "wss://backend/a").await.unwrap();
    pool.send(json!({ "n": 1 }), 1).await;
    assert_eq!(pool.statistics().queued_messages, 1);

    pool.shutdown();
    pool.shutdown();

    assert_eq!(pool.statistics().total_connections, 0);
    assert_eq!(pool.statistics().queued_messages, 0);

    // The transport was closed cleanly, and subscribers were dropped.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handles.lock().unwrap()[0].close_count(), 1);
    // Buffered lifecycle events drain, then the stream ends.
    while events.recv().await.is_some() {}
}
