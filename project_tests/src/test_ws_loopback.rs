//! # WebSocket Loopback Tests
//!
//! Runs a small `tokio-tungstenite` server on 127.0.0.1 and points a real
//! `WsConnector` at it. The server drops the first connection right after
//! answering, so the client has to reconnect and replay its subscription on
//! a genuine socket.

#![forbid(unsafe_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_radstream::transport::{
    ConnectionState, ReconnectPolicy, StreamClient, SubscriptionEvent, WsConnector,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

const LIMIT: Duration = Duration::from_secs(10);

/// Starts the server. Every subscribe frame is reported as
/// `(connection number, subscription id)` and answered with one data frame.
async fn start_server() -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut conn = 0;
        while let Ok((stream, _)) = listener.accept().await {
            conn += 1;
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if frame["type"] != "subscribe" {
                        continue;
                    }

                    let id = frame["id"].as_str().unwrap().to_string();
                    let _ = seen.send((conn, id.clone()));
                    let reply = json!({ "type": "data", "id": id, "payload": { "conn": conn } });
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                    if conn == 1 {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            });
        }
    });

    (format!("ws://{}", addr), seen_rx)
}

#[tokio::test]
async fn reconnects_and_resubscribes_over_a_real_socket() {
    let (url, mut seen) = start_server().await;
    let connector = WsConnector::new(&url, Duration::from_secs(2)).unwrap();
    let client = StreamClient::spawn(
        connector,
        ReconnectPolicy {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 100,
            backoff_multiplier: 1.0,
            max_reconnect_delay_ms: 1000,
        },
    );

    let mut sub = client.subscribe("subscription { particles }", Default::default());
    client.connect().unwrap();

    let first = timeout(LIMIT, sub.next()).await.unwrap();
    assert_eq!(first, Some(SubscriptionEvent::Data(json!({ "conn": 1 }))));

    let second = timeout(LIMIT, sub.next()).await.unwrap();
    assert_eq!(second, Some(SubscriptionEvent::Data(json!({ "conn": 2 }))));

    let (c1, id1) = seen.recv().await.unwrap();
    let (c2, id2) = seen.recv().await.unwrap();
    assert_eq!((c1, c2), (1, 2));
    assert_eq!(id1, sub.id());
    assert_eq!(id2, sub.id());

    timeout(LIMIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    client.shutdown();
}

#[tokio::test]
async fn unreachable_server_fails_without_retries() {
    // Bind and drop to get a port with nothing listening.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let connector = WsConnector::new(&format!("ws://127.0.0.1:{}", port), Duration::from_secs(2)).unwrap();
    let client = StreamClient::spawn(
        connector,
        ReconnectPolicy {
            max_reconnect_attempts: 0,
            ..Default::default()
        },
    );

    let mut sub = client.subscribe("subscription { particles }", Default::default());
    client.connect().unwrap();

    match timeout(LIMIT, sub.next()).await.unwrap() {
        Some(SubscriptionEvent::Error(e)) => assert!(e.is_transport(), "{}", e),
        other => panic!("unexpected {:?}", other),
    }
    timeout(LIMIT, client.wait_for_state(ConnectionState::Failed))
        .await
        .unwrap()
        .unwrap();
}
