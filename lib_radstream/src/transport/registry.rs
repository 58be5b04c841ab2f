//! # Channel Registry
//!
//! Bookkeeping for every subscription multiplexed over the connection. The
//! registry has no network dependency: it only maps ids to their query,
//! variables and delivery sink, and remembers the order subscriptions were
//! opened in so a reconnect can replay them in that same order.
//!
//! The registry is owned by the supervisor task, so it needs no locking.
//! Sinks are bounded: a subscriber that stops reading loses new events
//! instead of growing its queue.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::errors::StreamError;
use crate::transport::protocol::ClientFrame;
use crate::transport::subscription::SubscriptionEvent;

/// Events buffered per subscription before new ones are dropped.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 1024;

/// One registered subscription.
#[derive(Debug)]
pub struct RegisteredChannel {
    pub id: String,
    pub query: String,
    pub variables: Map<String, Value>,
    sink: mpsc::Sender<SubscriptionEvent>,
    seq: u64,
}

impl RegisteredChannel {
    /// The `subscribe` frame that (re)opens this channel.
    pub fn subscribe_frame(&self) -> ClientFrame {
        ClientFrame::subscribe(&self.id, &self.query, &self.variables)
    }
}

/// Outcome of routing an inbound event to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event was handed to the subscriber.
    Delivered,
    /// No channel with that id; the event was dropped.
    Unknown,
    /// The subscriber's queue is full; the event was dropped.
    Full,
    /// The subscriber dropped its handle; the channel was removed.
    Closed,
}

/// Subscription registry keyed by id, ordered by registration.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, RegisteredChannel>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel. An existing entry with the same id is replaced
    /// and moves to the end of the replay order.
    pub fn insert(
        &mut self,
        id: String,
        query: String,
        variables: Map<String, Value>,
        sink: mpsc::Sender<SubscriptionEvent>,
    ) {
        self.remove(&id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.clone());
        self.channels.insert(
            id.clone(),
            RegisteredChannel {
                id,
                query,
                variables,
                sink,
                seq,
            },
        );
    }

    /// Removes a channel, returning it if it was registered.
    pub fn remove(&mut self, id: &str) -> Option<RegisteredChannel> {
        let entry = self.channels.remove(id)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredChannel> {
        self.channels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels in registration order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &RegisteredChannel> + '_ {
        self.order.values().filter_map(move |id| self.channels.get(id))
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.iter_ordered().map(|c| c.id.clone()).collect()
    }

    /// Routes an event to the channel with the given id.
    ///
    /// A subscriber that has gone away is pruned so it stops receiving
    /// replays; the caller is expected to tell the server.
    pub fn deliver(&mut self, id: &str, event: SubscriptionEvent) -> Delivery {
        let Some(channel) = self.channels.get(id) else {
            return Delivery::Unknown;
        };

        match channel.sink.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => {
                self.remove(id);
                Delivery::Closed
            }
        }
    }

    /// Sends the same error to every channel. Returns the ids of channels
    /// whose subscriber was gone (they are removed).
    pub fn broadcast_error(&mut self, error: &StreamError) -> Vec<String> {
        let dead: Vec<String> = self
            .iter_ordered()
            .filter(|c| match c.sink.try_send(SubscriptionEvent::Error(error.clone())) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Queue of subscription {} is full; error not delivered.", c.id);
                    false
                }
                Err(TrySendError::Closed(_)) => true,
            })
            .map(|c| c.id.clone())
            .collect();

        for id in &dead {
            self.remove(id);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(reg: &mut ChannelRegistry, id: &str) -> mpsc::Receiver<SubscriptionEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let mut vars = Map::new();
        vars.insert("simulationId".to_string(), json!(id));
        reg.insert(id.to_string(), format!("query {}", id), vars, tx);
        rx
    }

    #[test]
    fn keeps_registration_order_across_removals() {
        let mut reg = ChannelRegistry::new();
        let _a = register(&mut reg, "a");
        let _b = register(&mut reg, "b");
        let _c = register(&mut reg, "c");

        reg.remove("b");
        let _d = register(&mut reg, "d");

        assert_eq!(reg.ids(), vec!["a", "c", "d"]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn delivers_to_the_matching_channel_only() {
        let mut reg = ChannelRegistry::new();
        let mut a = register(&mut reg, "a");
        let mut b = register(&mut reg, "b");

        let outcome = reg.deliver("b", SubscriptionEvent::Data(json!({"n": 1})));
        assert_eq!(outcome, Delivery::Delivered);
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), SubscriptionEvent::Data(json!({"n": 1})));
    }

    #[test]
    fn unknown_ids_are_reported_not_delivered() {
        let mut reg = ChannelRegistry::new();
        let _a = register(&mut reg, "a");
        assert_eq!(reg.deliver("zzz", SubscriptionEvent::Complete), Delivery::Unknown);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut reg = ChannelRegistry::new();
        let a = register(&mut reg, "a");
        drop(a);

        assert_eq!(reg.deliver("a", SubscriptionEvent::Complete), Delivery::Closed);
        assert!(!reg.contains("a"));
    }

    #[test]
    fn slow_subscriber_loses_new_events_but_stays_registered() {
        let mut reg = ChannelRegistry::new();
        let mut a = register(&mut reg, "a");

        for n in 0..SUBSCRIPTION_QUEUE_CAPACITY {
            assert_eq!(reg.deliver("a", SubscriptionEvent::Data(json!(n))), Delivery::Delivered);
        }
        assert_eq!(reg.deliver("a", SubscriptionEvent::Data(json!("late"))), Delivery::Full);
        assert!(reg.contains("a"));

        // Oldest events are kept; reading frees room for the next one.
        assert_eq!(a.try_recv().unwrap(), SubscriptionEvent::Data(json!(0)));
        assert_eq!(reg.deliver("a", SubscriptionEvent::Complete), Delivery::Delivered);
    }

    #[test]
    fn broadcast_error_reaches_every_live_channel() {
        let mut reg = ChannelRegistry::new();
        let mut a = register(&mut reg, "a");
        let b = register(&mut reg, "b");
        drop(b);

        let err = StreamError::Transport("refused".to_string());
        let dead = reg.broadcast_error(&err);

        assert_eq!(dead, vec!["b"]);
        assert_eq!(a.try_recv().unwrap(), SubscriptionEvent::Error(err));
        assert_eq!(reg.ids(), vec!["a"]);
    }

    #[test]
    fn subscribe_frame_carries_query_and_variables() {
        let mut reg = ChannelRegistry::new();
        let _a = register(&mut reg, "a");
        let frame = reg.get("a").unwrap().subscribe_frame();
        match frame {
            ClientFrame::Subscribe { id, payload } => {
                assert_eq!(id, "a");
                assert_eq!(payload.query, "query a");
                assert_eq!(payload.variables.get("simulationId"), Some(&json!("a")));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
