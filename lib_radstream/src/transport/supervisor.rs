//! # Reconnection Supervisor
//!
//! The supervisor is a single tokio task that owns everything with a
//! lifecycle: the channel registry, the current link, the retry timer and the
//! connection state. Client handles talk to it over a command channel, so
//! every state change is applied in one place, one at a time.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                    |
//!      +------ open failed -------+---- close/error ---+
//!              (retry scheduled while attempts remain, else Failed)
//! ```
//!
//! - Entering `Connected` replays every registry entry as a fresh `subscribe`
//!   frame, in registration order.
//! - Retries back off from `reconnect_interval_ms` and stop after
//!   `max_reconnect_attempts`; the state then stays `Failed` until the next
//!   explicit `connect()`.
//! - `disconnect()` clears the retry deadline, invalidates any in-flight
//!   attempt and suppresses auto-reconnect.
//!
//! Every connection attempt is stamped with an epoch. Results from an older
//! epoch are discarded, which drops (and so closes) their link.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::errors::StreamError;
use crate::transport::connector::{Connector, Link, LinkEvent};
use crate::transport::protocol::{parse_server_frame, ClientFrame, ServerFrame};
use crate::transport::registry::{ChannelRegistry, Delivery};
use crate::transport::subscription::SubscriptionEvent;

/// Connection lifecycle as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No live connection. A retry may be pending.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The link is open and subscriptions are live.
    Connected,
    /// Retries are exhausted. Stays here until `connect()` is called again.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Retry schedule for lost or failed connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Retries allowed after a loss before giving up. 0 disables retrying.
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry.
    pub reconnect_interval_ms: u64,
    /// Growth factor per retry. 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay.
    pub max_reconnect_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 1000,
            backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = (self.reconnect_interval_ms as f64 * factor).min(self.max_reconnect_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Requests from client handles to the supervisor task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe {
        id: String,
        query: String,
        variables: Map<String, Value>,
        sink: mpsc::Sender<SubscriptionEvent>,
    },
    Unsubscribe {
        id: String,
    },
    Shutdown,
}

type AttemptOutcome = (u64, Result<Link, StreamError>);

struct ActiveLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

pub(crate) struct Supervisor<C: Connector> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
    registry: ChannelRegistry,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    attempt_tx: mpsc::UnboundedSender<AttemptOutcome>,
    attempt_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
    link: Option<ActiveLink>,
    epoch: u64,
    failed_attempts: u32,
    retry_at: Option<Instant>,
    auto_reconnect: bool,
}

impl<C: Connector> Supervisor<C> {
    pub(crate) fn new(
        connector: C,
        policy: ReconnectPolicy,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(connector),
            policy,
            registry: ChannelRegistry::new(),
            state_tx,
            commands,
            attempt_tx,
            attempt_rx,
            link: None,
            epoch: 0,
            failed_attempts: 0,
            retry_at: None,
            auto_reconnect: false,
        }
    }

    /// Main loop. Returns once shut down or once every handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some((epoch, outcome)) = self.attempt_rx.recv() => {
                    self.on_attempt(epoch, outcome);
                }
                event = next_link_event(&mut self.link) => {
                    self.on_link_event(event);
                }
                _ = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    log::info!("Reconnect timer fired (attempt {}).", self.failed_attempts);
                    self.start_attempt();
                }
            }
        }

        self.link = None;
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("Stream supervisor stopped with {} registered subscriptions.", self.registry.len());
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            log::info!("Connection state: {} -> {}", prev, next);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => match self.state() {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    log::debug!("connect() ignored, already {}", self.state());
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.auto_reconnect = true;
                    self.failed_attempts = 0;
                    self.retry_at = None;
                    self.start_attempt();
                }
            },
            Command::Disconnect => {
                self.auto_reconnect = false;
                self.retry_at = None;
                // Any attempt still in flight belongs to an older epoch now.
                self.epoch += 1;
                if self.link.take().is_some() {
                    log::info!("Closing active connection on request.");
                }
                self.set_state(ConnectionState::Disconnected);
            }
            Command::Subscribe {
                id,
                query,
                variables,
                sink,
            } => {
                self.registry.insert(id.clone(), query, variables, sink);
                if let Some(frame) = self.registry.get(&id).map(|c| c.subscribe_frame()) {
                    if self.link.is_some() {
                        self.send_frame(&frame);
                    } else {
                        log::debug!("Queued subscription {} until connected.", id);
                    }
                }
            }
            Command::Unsubscribe { id } => {
                if self.registry.remove(&id).is_some() {
                    log::debug!("Unsubscribed {}", id);
                    if self.link.is_some() {
                        self.send_frame(&ClientFrame::unsubscribe(&id));
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn start_attempt(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.link = None;
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let results = self.attempt_tx.clone();
        tokio::spawn(async move {
            let outcome = connector.connect().await;
            let _ = results.send((epoch, outcome));
        });
    }

    fn on_attempt(&mut self, epoch: u64, outcome: Result<Link, StreamError>) {
        if epoch != self.epoch {
            log::debug!("Discarding stale connection attempt (epoch {} < {}).", epoch, self.epoch);
            return;
        }

        match outcome {
            Ok(link) => {
                self.link = Some(ActiveLink {
                    outbound: link.outbound,
                    inbound: link.inbound,
                });
                self.failed_attempts = 0;
                self.set_state(ConnectionState::Connected);
                self.resubscribe_all();
            }
            Err(e) => {
                log::error!("Connection attempt failed: {}", e);
                self.notify_error(&e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(text) => self.route_frame(&text),
            LinkEvent::Closed(reason) => {
                log::warn!(
                    "Connection lost: {}",
                    reason.as_deref().unwrap_or("closed by remote host")
                );
                self.link = None;
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    fn route_frame(&mut self, text: &str) {
        let frame = match parse_server_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}; frame dropped.", e);
                return;
            }
        };

        match frame {
            ServerFrame::Data { id, payload } => self.route(&id, SubscriptionEvent::Data(payload)),
            ServerFrame::Error { id, payload } => {
                log::warn!("Server reported an error for subscription {}: {}", id, payload);
                let event = SubscriptionEvent::Error(StreamError::Subscription {
                    id: id.clone(),
                    payload,
                });
                self.route(&id, event);
            }
            ServerFrame::Complete { id } => {
                self.route(&id, SubscriptionEvent::Complete);
                if self.registry.remove(&id).is_some() {
                    log::debug!("Subscription {} completed by server.", id);
                }
            }
        }
    }

    fn route(&mut self, id: &str, event: SubscriptionEvent) {
        match self.registry.deliver(id, event) {
            Delivery::Delivered => {}
            Delivery::Unknown => log::trace!("Dropping frame for unknown subscription {}", id),
            Delivery::Full => log::warn!("Subscriber {} is not keeping up; event dropped.", id),
            Delivery::Closed => {
                log::debug!("Subscriber for {} is gone; unsubscribing.", id);
                self.send_frame(&ClientFrame::unsubscribe(id));
            }
        }
    }

    fn resubscribe_all(&mut self) {
        let frames: Vec<ClientFrame> = self.registry.iter_ordered().map(|c| c.subscribe_frame()).collect();
        if !frames.is_empty() {
            log::info!("Resubscribing {} channel(s).", frames.len());
        }
        for frame in &frames {
            self.send_frame(frame);
        }
    }

    fn schedule_retry(&mut self) {
        if !self.auto_reconnect {
            return;
        }

        if self.failed_attempts >= self.policy.max_reconnect_attempts {
            log::error!(
                "Giving up after {} reconnect attempt(s); waiting for an explicit connect().",
                self.failed_attempts
            );
            self.set_state(ConnectionState::Failed);
            let err = StreamError::Transport(format!(
                "Reconnect attempts exhausted ({})",
                self.policy.max_reconnect_attempts
            ));
            self.notify_error(&err);
            return;
        }

        self.failed_attempts += 1;
        let delay = self.policy.delay_for(self.failed_attempts);
        log::warn!(
            "Reconnecting in {}ms (attempt {}/{}).",
            delay.as_millis(),
            self.failed_attempts,
            self.policy.max_reconnect_attempts
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn notify_error(&mut self, err: &StreamError) {
        for id in self.registry.broadcast_error(err) {
            log::debug!("Dropped subscription {} while reporting an error.", id);
        }
    }

    fn send_frame(&self, frame: &ClientFrame) {
        let Some(link) = &self.link else {
            return;
        };
        match frame.to_text() {
            Ok(text) => {
                if link.outbound.send(text).is_err() {
                    // The writer is gone; the reader reports the close.
                    log::warn!("Outbound queue closed; frame not sent.");
                }
            }
            Err(e) => log::error!("Failed to encode frame: {}", e),
        }
    }
}

async fn next_link_event(link: &mut Option<ActiveLink>) -> LinkEvent {
    match link {
        Some(active) => active.inbound.recv().await.unwrap_or(LinkEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn retry_due(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_when_multiplier_is_one() {
        let policy = ReconnectPolicy {
            backoff_multiplier: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy {
            reconnect_interval_ms: 500,
            backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 3000,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3000));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Failed.to_string(), "Failed");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }
}
