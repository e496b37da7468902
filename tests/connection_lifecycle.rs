//! End-to-end connection lifecycle tests against an in-process server.

mod common;

use common::{FixtureServer, StubAuthApi};
use lane_link::{
    ConnectionOptions, ConnectionState, EnvelopeKind, LaneLinkClient, LaneLinkTimeouts,
    MemoryBackend,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn client_for(server: &FixtureServer) -> LaneLinkClient {
    let client = LaneLinkClient::builder(server.url.clone())
        .auth_api(Arc::new(StubAuthApi))
        .storage_backend(Arc::new(MemoryBackend::new()))
        .debounce_window(Duration::ZERO)
        .connection_options(
            ConnectionOptions::default()
                .with_reconnect_delay_ms(10)
                .with_max_reconnect_delay_ms(50)
                .with_max_reconnect_attempts(5),
        )
        .timeouts(LaneLinkTimeouts::fast())
        .build()
        .unwrap();
    client.login("tester", "secret").await.unwrap();
    client
}

async fn wait_for_state(client: &LaneLinkClient, wanted: ConnectionState) {
    let mut state_rx = client.watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *state_rx.borrow_and_update() != wanted {
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached state {}", wanted));
}

#[tokio::test]
async fn test_publish_roundtrip_through_subscription() {
    let server = FixtureServer::start().await;
    let client = client_for(&server).await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    client
        .subscribe("tasks", move |event| {
            let _ = event_tx.send(event);
        })
        .await;
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    client.send("tasks", json!({"id": "T1"})).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.channel, "tasks");
    assert_eq!(event.payload["id"], "T1");

    // The server saw the subscription before the publish.
    let kinds: Vec<EnvelopeKind> = server.received().iter().map(|e| e.kind).collect();
    let sub = kinds.iter().position(|k| *k == EnvelopeKind::Subscribe).unwrap();
    let publish = kinds.iter().position(|k| *k == EnvelopeKind::Publish).unwrap();
    assert!(sub < publish);

    client.close().await;
}

#[tokio::test]
async fn test_offline_sends_flush_exactly_once_in_order() {
    let server = FixtureServer::start().await;
    let client = client_for(&server).await;

    for n in 0..5 {
        client.send("tasks", json!({"n": n})).await.unwrap();
    }
    assert_eq!(client.queued_messages().await.unwrap(), 5);
    assert!(server.received().is_empty(), "nothing reaches the wire while offline");

    client.connect().await.unwrap();
    server
        .wait_until("5 flushed publishes", |received| {
            received.iter().filter(|e| e.kind == EnvelopeKind::Publish).count() == 5
        })
        .await;

    let publishes = server.received_of(EnvelopeKind::Publish);
    for (n, envelope) in publishes.iter().enumerate() {
        assert_eq!(envelope.payload["n"], n, "flush preserves FIFO order");
    }
    assert_eq!(client.queued_messages().await.unwrap(), 0);

    // Exactly once: nothing further shows up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_of(EnvelopeKind::Publish).len(), 5);

    client.close().await;
}

#[tokio::test]
async fn test_disconnect_queue_reconnect_delivers_to_handler() {
    let server = FixtureServer::start().await;
    let client = client_for(&server).await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    client
        .subscribe("tasks", move |event| {
            let _ = event_tx.send(event);
        })
        .await;

    client.connect().await.unwrap();
    client.disconnect().await.unwrap();
    wait_for_state(&client, ConnectionState::Disconnected).await;

    for n in 0..3 {
        client.send("tasks", json!({"n": n})).await.unwrap();
    }

    client.connect().await.unwrap();
    for n in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("handler never saw the flushed message")
            .unwrap();
        assert_eq!(event.payload["n"], n);
    }

    client.close().await;
}

#[tokio::test]
async fn test_server_drop_triggers_reconnect_and_resubscribe() {
    let server = FixtureServer::start().await;
    let client = client_for(&server).await;

    client.subscribe("tasks", |_event| {}).await;
    client.connect().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    server.drop_connections();
    wait_for_state(&client, ConnectionState::Connected).await;
    assert!(server.connection_count() >= 2, "a replacement connection was dialed");

    // The channel was announced again on the new connection.
    server
        .wait_until("re-subscription", |received| {
            received.iter().filter(|e| e.kind == EnvelopeKind::Subscribe).count() >= 2
        })
        .await;

    client.close().await;
}

#[tokio::test]
async fn test_heartbeats_flow_while_connected() {
    let server = FixtureServer::start().await;
    let client = LaneLinkClient::builder(server.url.clone())
        .auth_api(Arc::new(StubAuthApi))
        .storage_backend(Arc::new(MemoryBackend::new()))
        .debounce_window(Duration::ZERO)
        .timeouts(
            LaneLinkTimeouts::builder()
                .heartbeat_interval(Duration::from_millis(50))
                .build(),
        )
        .build()
        .unwrap();
    client.login("tester", "secret").await.unwrap();
    client.connect().await.unwrap();

    server
        .wait_until("two heartbeats", |received| {
            received.iter().filter(|e| e.kind == EnvelopeKind::Heartbeat).count() >= 2
        })
        .await;
    // The connection stayed up across acknowledged heartbeats.
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.connection_count(), 1);

    client.close().await;
}
