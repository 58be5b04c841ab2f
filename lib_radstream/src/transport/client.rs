//! # Stream Client
//!
//! `StreamClient` is the cheap, cloneable handle applications hold. It spawns
//! the supervisor task on creation and forwards `connect`, `disconnect` and
//! `subscribe` requests to it. Subscriptions may be opened at any time; while
//! disconnected they are queued and sent as soon as a link is up.

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::errors::StreamError;
use crate::transport::connector::Connector;
use crate::transport::registry::SUBSCRIPTION_QUEUE_CAPACITY;
use crate::transport::subscription::{Subscription, SubscriptionEvent};
use crate::transport::supervisor::{Command, ConnectionState, ReconnectPolicy, Supervisor};

/// Handle to one multiplexed streaming connection.
#[derive(Debug, Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamClient {
    /// Spawns the supervisor on the current tokio runtime. The client starts
    /// `Disconnected`; call [`StreamClient::connect`] to open the link.
    pub fn spawn<C: Connector>(connector: C, policy: ReconnectPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let supervisor = Supervisor::new(connector, policy, cmd_rx, state_tx);
        tokio::spawn(supervisor.run());

        Self {
            commands: cmd_tx,
            state: state_rx,
        }
    }

    /// Opens the connection and enables auto-reconnect. A no-op while already
    /// connecting or connected; from `Failed` it starts a fresh retry budget.
    pub fn connect(&self) -> Result<(), StreamError> {
        self.send(Command::Connect)
    }

    /// Closes the connection, cancels any pending retry and disables
    /// auto-reconnect. Registered subscriptions are kept and replayed on the
    /// next `connect()`.
    pub fn disconnect(&self) -> Result<(), StreamError> {
        self.send(Command::Disconnect)
    }

    /// Registers a subscription under a fresh random id.
    ///
    /// Never fails up front: if the client is already shut down the returned
    /// handle yields a single [`StreamError::Closed`] and ends. A handle
    /// buffers up to [`SUBSCRIPTION_QUEUE_CAPACITY`] unread events; newer
    /// ones are dropped while it is full.
    pub fn subscribe(&self, query: &str, variables: Map<String, Value>) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (sink, events) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);

        let cmd = Command::Subscribe {
            id: id.clone(),
            query: query.to_string(),
            variables,
            sink,
        };
        if let Err(mpsc::error::SendError(Command::Subscribe { sink, .. })) = self.commands.send(cmd) {
            let _ = sink.try_send(SubscriptionEvent::Error(StreamError::Closed));
        }

        Subscription::new(id, events, self.commands.clone())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), StreamError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target).await.map(|_| ()).map_err(|_| StreamError::Closed)
    }

    /// Stops the supervisor and closes the link. Outstanding subscriptions
    /// end without further events.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) -> Result<(), StreamError> {
        self.commands.send(cmd).map_err(|_| StreamError::Closed)
    }
}

/// Converts a JSON object into subscription variables. Anything other than an
/// object yields an empty map.
pub fn variables(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::sleep;

    use super::*;
    use crate::transport::connector::Link;
    use crate::transport::memory::{MemoryConnector, ServerEnd};
    use crate::transport::protocol::ClientFrame;

    fn policy(max: u32, interval_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_reconnect_attempts: max,
            reconnect_interval_ms: interval_ms,
            backoff_multiplier: 1.0,
            max_reconnect_delay_ms: 60_000,
        }
    }

    async fn expect_subscribe(end: &mut ServerEnd) -> (String, String) {
        match end.recv_frame().await {
            Some(ClientFrame::Subscribe { id, payload }) => (id, payload.query),
            other => panic!("expected subscribe frame, got {:?}", other),
        }
    }

    async fn wait_attempts(connector: &MemoryConnector, n: usize) {
        while connector.attempts().len() < n {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_queue_until_connected() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));

        let sub = client.subscribe("subscription { a }", Map::new());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();
        let (id, query) = expect_subscribe(&mut end).await;

        assert_eq!(id, sub.id());
        assert_eq!(query, "subscription { a }");
        client.wait_for_state(ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn routes_frames_by_id_and_ignores_noise() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let mut a = client.subscribe("a", Map::new());
        let mut b = client.subscribe("b", Map::new());
        expect_subscribe(&mut end).await;
        expect_subscribe(&mut end).await;

        end.send_text("{ not json");
        end.send_data("no-such-id", json!({"x": 1}));
        end.send_data(b.id(), json!({"n": 2}));
        end.send_data(a.id(), json!({"n": 1}));

        assert_eq!(a.next_event().await, Some(SubscriptionEvent::Data(json!({"n": 1}))));
        assert_eq!(b.next_event().await, Some(SubscriptionEvent::Data(json!({"n": 2}))));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn error_frames_do_not_end_the_subscription() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let mut sub = client.subscribe("a", Map::new());
        let (id, _) = expect_subscribe(&mut end).await;

        end.send_text(format!(r#"{{"type":"error","id":"{}","payload":{{"message":"denied"}}}}"#, id));
        end.send_data(&id, json!(1));

        match sub.next_event().await {
            Some(SubscriptionEvent::Error(StreamError::Subscription { id: err_id, payload })) => {
                assert_eq!(err_id, id);
                assert_eq!(payload, json!({"message": "denied"}));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sub.next_event().await, Some(SubscriptionEvent::Data(json!(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_ends_the_stream() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let mut sub = client.subscribe("a", Map::new());
        let (id, _) = expect_subscribe(&mut end).await;
        end.send_text(format!(r#"{{"type":"complete","id":"{}"}}"#, id));

        assert_eq!(sub.next_event().await, Some(SubscriptionEvent::Complete));
        assert_eq!(sub.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_handle_sends_unsubscribe() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let sub = client.subscribe("a", Map::new());
        let (id, _) = expect_subscribe(&mut end).await;
        drop(sub);

        assert_eq!(end.recv_frame().await, Some(ClientFrame::Unsubscribe { id }));
    }

    #[tokio::test(start_paused = true)]
    async fn replays_all_subscriptions_after_a_drop() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut first = server.accept().await.unwrap();

        let a = client.subscribe("a", Map::new());
        let b = client.subscribe("b", Map::new());
        let c = client.subscribe("c", Map::new());
        for _ in 0..3 {
            expect_subscribe(&mut first).await;
        }
        drop(b);
        assert!(matches!(first.recv_frame().await, Some(ClientFrame::Unsubscribe { .. })));

        first.close(Some("server restart"));
        let mut second = server.accept().await.unwrap();

        let (id1, _) = expect_subscribe(&mut second).await;
        let (id2, _) = expect_subscribe(&mut second).await;
        assert_eq!(vec![id1, id2], vec![a.id().to_string(), c.id().to_string()]);
        client.wait_for_state(ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_the_configured_interval() {
        let (connector, mut server) = MemoryConnector::new();
        connector.fail_next(1);
        let client = StreamClient::spawn(connector.clone(), policy(3, 1000));

        client.connect().unwrap();
        let _end = server.accept().await.unwrap();

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        let gap = attempts[1] - attempts[0];
        assert!(gap >= Duration::from_millis(1000) && gap < Duration::from_millis(1010), "gap {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_recovers_on_connect() {
        let (connector, mut server) = MemoryConnector::new();
        connector.fail_next(100);
        let client = StreamClient::spawn(connector.clone(), policy(2, 100));

        let mut sub = client.subscribe("a", Map::new());
        client.connect().unwrap();
        client.wait_for_state(ConnectionState::Failed).await.unwrap();

        // One initial attempt plus two retries.
        assert_eq!(connector.attempts().len(), 3);
        match sub.next_event().await {
            Some(SubscriptionEvent::Error(e)) => assert!(e.is_transport()),
            other => panic!("unexpected {:?}", other),
        }

        connector.fail_next(0);
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();
        let (id, _) = expect_subscribe(&mut end).await;
        assert_eq!(id, sub.id());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_pending_retry() {
        let (connector, _server) = MemoryConnector::new();
        connector.fail_next(1);
        let client = StreamClient::spawn(connector.clone(), policy(3, 1000));

        client.connect().unwrap();
        wait_attempts(&connector, 1).await;
        sleep(Duration::from_millis(10)).await;
        client.disconnect().unwrap();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_registrations_for_the_next_connect() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 1000));
        client.connect().unwrap();
        let mut first = server.accept().await.unwrap();

        let sub = client.subscribe("a", Map::new());
        expect_subscribe(&mut first).await;

        client.disconnect().unwrap();
        assert_eq!(first.recv_text().await, None);

        client.connect().unwrap();
        let mut second = server.accept().await.unwrap();
        let (id, _) = expect_subscribe(&mut second).await;
        assert_eq!(id, sub.id());
    }

    #[tokio::test(start_paused = true)]
    async fn handles_closed_while_disconnected_are_not_replayed() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, policy(3, 100));

        let keep = client.subscribe("keep", Map::new());
        client.subscribe("closed", Map::new()).close();
        drop(client.subscribe("dropped", Map::new()));
        client.connect().unwrap();

        for _ in 0..2 {
            let mut end = server.accept().await.unwrap();
            let (id, query) = expect_subscribe(&mut end).await;
            assert_eq!((id.as_str(), query.as_str()), (keep.id(), "keep"));

            // The next frame is a fresh subscription, so nothing else was replayed.
            let marker = client.subscribe("marker", Map::new());
            let (marker_id, _) = expect_subscribe(&mut end).await;
            assert_eq!(marker_id, marker.id());
            drop(marker);
            end.close(None);
        }
    }

    /// Opens links only after `delay`.
    struct SlowConnector {
        inner: MemoryConnector,
        delay: Duration,
    }

    impl Connector for SlowConnector {
        fn connect(&self) -> impl std::future::Future<Output = Result<Link, StreamError>> + Send {
            let attempt = self.inner.connect();
            let delay = self.delay;
            async move {
                sleep(delay).await;
                attempt.await
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_finishing_after_disconnect_is_discarded() {
        let (inner, mut server) = MemoryConnector::new();
        let connector = SlowConnector {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        };
        let client = StreamClient::spawn(connector, policy(3, 100));
        let _sub = client.subscribe("a", Map::new());

        client.connect().unwrap();
        client.wait_for_state(ConnectionState::Connecting).await.unwrap();
        client.disconnect().unwrap();
        client.wait_for_state(ConnectionState::Disconnected).await.unwrap();

        // The late link still opens, but it is dropped without a single frame.
        let mut end = server.accept().await.unwrap();
        assert_eq!(end.recv_text().await, None);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(inner.attempts().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_yields_closed() {
        let (connector, _server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, ReconnectPolicy::default());
        client.shutdown();
        client.wait_for_state(ConnectionState::Disconnected).await.unwrap();
        // Let the supervisor drop its receiver.
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(20)).await;

        let mut sub = client.subscribe("a", Map::new());
        assert_eq!(sub.next_event().await, Some(SubscriptionEvent::Error(StreamError::Closed)));
        assert!(client.connect().is_err());
    }

    #[test]
    fn variables_accepts_objects_only() {
        assert_eq!(variables(json!({"a": 1})).len(), 1);
        assert!(variables(json!([1, 2])).is_empty());
    }
}
