//! # Resubscription Integration Tests
//!
//! Drives a `StreamClient` over the in-memory transport and checks that the
//! set of live subscriptions survives every kind of connection loss, and that
//! retries follow the configured schedule.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::StreamExt;
use lib_radstream::transport::protocol::ClientFrame;
use lib_radstream::transport::{
    variables, ConnectionState, MemoryConnector, ReconnectPolicy, ServerEnd, StreamClient, SubscriptionEvent,
};
use serde_json::json;

fn policy(max: u32, interval_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        max_reconnect_attempts: max,
        reconnect_interval_ms: interval_ms,
        backoff_multiplier: 1.0,
        max_reconnect_delay_ms: 60_000,
    }
}

/// Reads `n` subscribe frames and returns their ids in arrival order.
async fn read_subscribes(end: &mut ServerEnd, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    while ids.len() < n {
        match end.recv_frame().await {
            Some(ClientFrame::Subscribe { id, .. }) => ids.push(id),
            Some(ClientFrame::Unsubscribe { .. }) => {}
            None => panic!("client closed the link early"),
        }
    }
    ids
}

#[tokio::test(start_paused = true)]
async fn registered_set_is_identical_after_reconnect() {
    let (connector, mut server) = MemoryConnector::new();
    let client = StreamClient::spawn(connector, policy(5, 500));
    client.connect().unwrap();
    let mut first = server.accept().await.unwrap();

    let mut subs: Vec<_> = (0..6)
        .map(|i| client.subscribe("subscription { particles }", variables(json!({ "simulationId": i }))))
        .collect();
    read_subscribes(&mut first, 6).await;

    // Two handles go away before the drop.
    subs.remove(4).close();
    subs.remove(1);
    let expected: Vec<String> = subs.iter().map(|s| s.id().to_string()).collect();

    for round in 0..3 {
        first.close(Some("maintenance"));
        first = server.accept().await.unwrap();
        let replayed = read_subscribes(&mut first, expected.len()).await;
        assert_eq!(replayed, expected, "round {}", round);
    }

    let live: BTreeSet<String> = expected.iter().cloned().collect();
    assert_eq!(live.len(), 4);
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn data_keeps_flowing_to_the_same_handle() {
    let (connector, mut server) = MemoryConnector::new();
    let client = StreamClient::spawn(connector, policy(5, 500));
    client.connect().unwrap();
    let mut end = server.accept().await.unwrap();

    let mut sub = client.subscribe("subscription { sensors }", Default::default());
    let id = read_subscribes(&mut end, 1).await.remove(0);
    end.send_data(&id, json!({ "seq": 1 }));
    assert_eq!(sub.next().await, Some(SubscriptionEvent::Data(json!({ "seq": 1 }))));

    end.close(None);
    let mut end = server.accept().await.unwrap();
    assert_eq!(read_subscribes(&mut end, 1).await, vec![id.clone()]);

    end.send_data(&id, json!({ "seq": 2 }));
    assert_eq!(sub.next().await, Some(SubscriptionEvent::Data(json!({ "seq": 2 }))));
}

#[tokio::test(start_paused = true)]
async fn retry_happens_after_the_configured_interval() {
    let (connector, mut server) = MemoryConnector::new();
    connector.fail_next(1);
    let client = StreamClient::spawn(connector.clone(), policy(3, 1000));

    client.connect().unwrap();
    let _end = server.accept().await.unwrap();

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    let gap = attempts[1] - attempts[0];
    assert!(gap >= Duration::from_millis(1000), "retried too early: {:?}", gap);
    assert!(gap < Duration::from_millis(1050), "retried too late: {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_between_failures() {
    let (connector, mut server) = MemoryConnector::new();
    connector.fail_next(3);
    let client = StreamClient::spawn(
        connector.clone(),
        ReconnectPolicy {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 100,
            backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 10_000,
        },
    );

    client.connect().unwrap();
    let _end = server.accept().await.unwrap();

    let attempts = connector.attempts();
    let gaps: Vec<u128> = attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    assert_eq!(gaps, vec![100, 200, 400]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_reach_every_subscriber() {
    let (connector, _server) = MemoryConnector::new();
    connector.fail_next(u32::MAX);
    let client = StreamClient::spawn(connector.clone(), policy(1, 100));

    let mut a = client.subscribe("a", Default::default());
    let mut b = client.subscribe("b", Default::default());
    client.connect().unwrap();
    client.wait_for_state(ConnectionState::Failed).await.unwrap();

    for sub in [&mut a, &mut b] {
        match sub.next().await {
            Some(SubscriptionEvent::Error(e)) => assert!(e.is_transport()),
            other => panic!("unexpected {:?}", other),
        }
    }

    // Failed is terminal: no further attempts without connect().
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts().len(), 2);
}
