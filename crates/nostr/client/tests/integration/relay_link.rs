//! Relay connection tests against an in-process WebSocket relay

use super::*;
use futures::{SinkExt, StreamExt};
use nostr_client::{
    ConnectionState, EventHandler, GatewayConfig, RelayConnection, RelayGateway, RelayPool,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Subscription id that makes the test relay hang up.
const HANG_UP: &str = "hang-up";

/// Minimal relay: answers REQ with every stored event then EOSE, answers
/// EVENT with OK (rejecting content "reject"), and closes the socket when
/// asked for the `HANG_UP` subscription.
async fn start_relay(stored: Vec<Event>) -> (String, JoinHandle<()>) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let stored = Arc::new(stored);

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let stored = Arc::clone(&stored);
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                while let Some(Ok(msg)) = read.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let mut replies = Vec::new();
                    match frame.first().and_then(Value::as_str) {
                        Some("REQ") => {
                            let id = frame[1].as_str().unwrap_or_default().to_string();
                            if id == HANG_UP {
                                let _ = write.close().await;
                                return;
                            }
                            for event in stored.iter() {
                                replies.push(json!(["EVENT", id, event]));
                            }
                            replies.push(json!(["EOSE", id]));
                        }
                        Some("EVENT") => {
                            let id = frame[1]["id"].as_str().unwrap_or_default();
                            let accepted = frame[1]["content"] != "reject";
                            let reason = if accepted { "" } else { "blocked: test" };
                            replies.push(json!(["OK", id, accepted, reason]));
                        }
                        _ => {}
                    }
                    for reply in replies {
                        if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    (url, handle)
}

#[tokio::test]
async fn test_connect_and_publish_confirmation() {
    let (url, relay) = start_relay(Vec::new()).await;
    let connection = RelayConnection::new(&url).unwrap();
    connection.connect().await.unwrap();
    assert_eq!(connection.state().await, ConnectionState::Connected);
    assert!(matches!(
        connection.connect().await,
        Err(ClientError::AlreadyConnected)
    ));

    let event = signed_event(1, "hello relay");
    let confirmation = connection
        .publish_event(&event, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, event.id.to_hex());

    let rejected = signed_event(1, "reject");
    let confirmation = connection
        .publish_event(&rejected, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!confirmation.accepted);
    assert_eq!(confirmation.message, "blocked: test");

    connection.disconnect().await.unwrap();
    assert_eq!(connection.state().await, ConnectionState::Disconnected);
    relay.abort();
}

#[tokio::test]
async fn test_subscription_frames_are_broadcast() {
    let stored = vec![signed_event(1, "first"), signed_event(1, "second")];
    let (url, relay) = start_relay(stored.clone()).await;
    let connection = RelayConnection::new(&url).unwrap();
    let mut notifications = connection.subscribe_messages();
    connection.connect().await.unwrap();

    connection
        .subscribe("sub1", &[Filter::new().kinds([1])])
        .await
        .unwrap();

    let mut received = Vec::new();
    let collected = timeout(Duration::from_secs(2), async {
        loop {
            match notifications.recv().await.unwrap() {
                RelayNotification::Message(RelayMessage::Event {
                    subscription_id,
                    event,
                }) => {
                    assert_eq!(subscription_id, "sub1");
                    received.push(event);
                }
                RelayNotification::Message(RelayMessage::Eose { .. }) => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "no EOSE from test relay");
    assert_eq!(received, stored);

    connection.disconnect().await.unwrap();
    relay.abort();
}

#[tokio::test]
async fn test_relay_hang_up_is_reported() {
    let (url, relay) = start_relay(Vec::new()).await;
    let connection = RelayConnection::new(&url).unwrap();
    let mut notifications = connection.subscribe_messages();
    connection.connect().await.unwrap();

    connection.subscribe(HANG_UP, &[Filter::new()]).await.unwrap();

    let dropped = timeout(Duration::from_secs(2), async {
        loop {
            if let RelayNotification::Disconnected { .. } = notifications.recv().await.unwrap() {
                break;
            }
        }
    })
    .await;
    assert!(dropped.is_ok(), "hang-up not reported");
    assert_eq!(connection.state().await, ConnectionState::Disconnected);
    relay.abort();
}

#[tokio::test]
async fn test_pool_fetch_deduplicates_across_relays() {
    let stored = vec![signed_event(1, "shared")];
    let (url_a, relay_a) = start_relay(stored.clone()).await;
    let (url_b, relay_b) = start_relay(stored.clone()).await;

    let pool = RelayPool::new(Keys::generate());
    pool.add_relay(&url_a).await.unwrap();
    pool.add_relay(&url_b).await.unwrap();
    assert!(pool.connect().await);
    assert_eq!(pool.connected_relays().await.len(), 2);

    let events = pool
        .fetch(&Filter::new().kinds([1]), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(events, stored);

    let output = pool
        .publish(&signed_event(1, "fan out"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(output.success.len(), 2);
    assert!(output.failed.is_empty());

    pool.disconnect().await.unwrap();
    relay_a.abort();
    relay_b.abort();
}

#[tokio::test]
async fn test_gateway_delivers_only_verified_events_from_relay() {
    let valid = signed_event(1, "from the wire");
    let stored = vec![tampered(&signed_event(1, "forged")), valid.clone()];
    let (url, relay) = start_relay(stored).await;

    let gateway = RelayGateway::new(Keys::generate(), GatewayConfig::default());
    assert!(gateway.connect(&[url]).await);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = EventHandler::sync(move |event| {
        sink.lock().unwrap().push(event.id);
        Ok(())
    });
    gateway
        .subscribe(Some(Filter::new().kinds([1])), Some(handler))
        .await
        .unwrap();

    assert!(eventually(|| !received.lock().unwrap().is_empty()).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(*received.lock().unwrap(), vec![valid.id]);

    gateway.disconnect().await;
    relay.abort();
}
