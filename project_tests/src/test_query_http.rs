//! # Query Client Tests
//!
//! Drives `QueryClient` and `SensorPoller` against a minimal HTTP/1.1 mock
//! listening on 127.0.0.1. Each accepted connection is answered with the next
//! canned response and closed; the request seen by the mock is handed back
//! to the test.

#![forbid(unsafe_code)]

use std::time::Duration;

use lib_radstream::geo::{ClusterConfig, ClusterStrategy};
use lib_radstream::ingestors::{SensorPoller, SensorPollerConfig};
use lib_radstream::retrieve::QueryClient;
use lib_radstream::StreamError;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the mock saw for one request.
#[derive(Debug)]
struct SeenRequest {
    head: String,
    body: Value,
}

async fn read_request(stream: &mut TcpStream) -> SeenRequest {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    SeenRequest {
        head,
        body: serde_json::from_slice(&buf[head_end..head_end + length]).unwrap_or(Value::Null),
    }
}

/// Serves `responses` in order, one per connection.
async fn mock_server(responses: Vec<(u16, String)>) -> (String, mpsc::UnboundedReceiver<SeenRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let seen = read_request(&mut stream).await;
            let _ = tx.send(seen);

            let reason = if status == 200 { "OK" } else { "Bad Request" };
            let reply = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{}/graphql", addr), rx)
}

#[derive(Debug, Deserialize, PartialEq)]
struct Sensors {
    sensors: Vec<Value>,
}

#[tokio::test]
async fn execute_posts_query_and_decodes_data() {
    let body = json!({ "data": { "sensors": [{ "id": "s1" }] } }).to_string();
    let (url, mut seen) = mock_server(vec![(200, body)]).await;
    let client = QueryClient::new(&url, Some("secret".to_string())).unwrap();

    let mut variables = Map::new();
    variables.insert("region".to_string(), json!("north"));
    let out: Sensors = client.execute("query Sensors { sensors { id } }", &variables).await.unwrap();
    assert_eq!(out.sensors, vec![json!({ "id": "s1" })]);

    let request = seen.recv().await.unwrap();
    assert!(request.head.starts_with("POST /graphql"));
    assert!(request.head.to_ascii_lowercase().contains("authorization: bearer secret"));
    assert_eq!(request.body["query"], "query Sensors { sensors { id } }");
    assert_eq!(request.body["variables"], json!({ "region": "north" }));
}

#[tokio::test]
async fn error_envelopes_and_bad_status_fail() {
    let responses = vec![
        (200, json!({ "errors": [{ "message": "not authorised" }] }).to_string()),
        (400, "malformed query".to_string()),
        (200, json!({ "data": null }).to_string()),
    ];
    let (url, _seen) = mock_server(responses).await;
    let client = QueryClient::new(&url, None).unwrap();

    let err = client.execute::<Sensors>("q", &Map::new()).await.unwrap_err();
    assert_eq!(err, StreamError::Request("not authorised".to_string()));

    match client.execute::<Sensors>("q", &Map::new()).await.unwrap_err() {
        StreamError::Request(msg) => assert!(msg.starts_with("HTTP 400"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }

    assert!(matches!(
        client.execute::<Sensors>("q", &Map::new()).await,
        Err(StreamError::Request(_))
    ));
}

#[test]
fn rejects_non_http_endpoints() {
    assert!(QueryClient::new("ws://127.0.0.1:1/graphql", None).is_err());
    assert!(QueryClient::new("not a url", None).is_err());
}

fn poller_config() -> SensorPollerConfig {
    SensorPollerConfig {
        query: "query Sensors { sensors { id lat lon value } }".to_string(),
        variables: Map::new(),
        zoom: 2.0,
        poll_interval: Duration::from_millis(50),
        retry_delay: Duration::from_millis(50),
        clustering: ClusterConfig::default(),
    }
}

#[tokio::test]
async fn poll_once_clusters_and_publishes() {
    let body = json!({ "data": { "sensors": [
        { "id": "a", "lat": 45.0, "lon": 7.0, "value": 1.0 },
        { "id": "b", "lat": 45.45, "lon": 7.0, "value": 3.0 },
        { "id": "c", "lat": -33.9, "lon": 151.2, "value": 9.0 }
    ] } })
    .to_string();
    let (url, _seen) = mock_server(vec![(200, body)]).await;
    let (poller, snapshots) = SensorPoller::new(QueryClient::new(&url, None).unwrap(), poller_config());
    assert!(snapshots.borrow().is_none());

    let snapshot = poller.poll_once().await.unwrap();
    assert_eq!(snapshot.point_count, 3);
    assert_eq!(snapshot.strategy, ClusterStrategy::Distance);
    assert_eq!(snapshot.clusters.len(), 2);
    assert_eq!(snapshot.clusters.iter().map(|c| c.count).sum::<usize>(), 3);

    assert_eq!(snapshots.borrow().as_ref(), Some(&snapshot));
}

#[tokio::test]
async fn run_keeps_last_snapshot_through_failures() {
    let good = json!({ "data": { "sensors": [{ "lat": 1.0, "lon": 1.0, "value": 4.0 }] } }).to_string();
    let responses = vec![
        (200, good),
        (400, "boom".to_string()),
        (200, json!({ "data": { "sensors": [] } }).to_string()),
    ];
    let (url, mut seen) = mock_server(responses).await;
    let (poller, mut snapshots) = SensorPoller::new(QueryClient::new(&url, None).unwrap(), poller_config());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller.run(cancel.clone()));

    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow_and_update().as_ref().map(|s| s.point_count), Some(1));

    // The failed poll publishes nothing; the next success replaces it.
    seen.recv().await.unwrap();
    seen.recv().await.unwrap();
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow().as_ref().map(|s| s.point_count), Some(0));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn large_snapshot_is_clustered_within_the_cap() {
    let sensors: Vec<Value> = (0..2000)
        .map(|i| json!({ "id": i.to_string(), "lat": 40.05 + (i / 50) as f64 * 0.1, "lon": 5.05 + (i % 50) as f64 * 0.1, "value": 1.0 }))
        .collect();
    let body = json!({ "data": { "sensors": sensors } }).to_string();
    let (url, _seen) = mock_server(vec![(200, body)]).await;
    let (poller, _snapshots) = SensorPoller::new(QueryClient::new(&url, None).unwrap(), poller_config());

    let snapshot = tokio::time::timeout(Duration::from_secs(30), poller.poll_once())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.strategy, ClusterStrategy::Grid);
    assert_eq!(snapshot.point_count, 2000);
    assert!(snapshot.clusters.len() <= 200);
    assert_eq!(snapshot.clusters.iter().map(|c| c.count).sum::<usize>(), 2000);
}
