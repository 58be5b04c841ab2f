//! # Subscription Handle
//!
//! A `Subscription` is the consumer's end of one multiplexed channel. It
//! yields [`SubscriptionEvent`]s as a `futures::Stream` and unsubscribes when
//! closed or dropped. The handle stays valid across reconnects: the
//! supervisor re-opens the channel on every new connection under the same id.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::StreamError;
use crate::transport::supervisor::Command;

/// Everything a subscriber can observe on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A `data` frame payload.
    Data(Value),
    /// A server-reported error for this id, or a transport failure.
    Error(StreamError),
    /// The server completed the subscription. No more events follow.
    Complete,
}

/// Handle to a live subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    events: mpsc::Receiver<SubscriptionEvent>,
    commands: mpsc::UnboundedSender<Command>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        events: mpsc::Receiver<SubscriptionEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            commands,
            closed: false,
        }
    }

    /// The randomly generated id of this subscription.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next event. `None` once the subscription completed or
    /// the client shut down.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Unsubscribes. Pending events are discarded.
    pub fn close(mut self) {
        self.unsubscribe();
    }

    /// Wraps the handle so data payloads are decoded into `T`.
    pub fn typed<T: DeserializeOwned>(self) -> TypedSubscription<T> {
        TypedSubscription {
            inner: self,
            _marker: PhantomData,
        }
    }

    fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        // The supervisor may already be gone; nothing left to cancel then.
        let _ = self.commands.send(Command::Unsubscribe { id: self.id.clone() });
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A subscription whose data payloads are decoded into `T`.
#[derive(Debug)]
pub struct TypedSubscription<T> {
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSubscription<T> {
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Next decoded payload. Decoding failures surface as protocol errors,
    /// errors reported on the channel as-is; completion ends the sequence.
    pub async fn next(&mut self) -> Option<Result<T, StreamError>> {
        match self.inner.next_event().await? {
            SubscriptionEvent::Data(payload) => Some(decode_payload(payload)),
            SubscriptionEvent::Error(e) => Some(Err(e)),
            SubscriptionEvent::Complete => None,
        }
    }

    pub fn close(self) {
        self.inner.close();
    }
}

/// Decodes a frame payload into a typed message.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, StreamError> {
    serde_json::from_value(payload).map_err(|e| StreamError::Protocol(format!("Unexpected payload shape: {}", e)))
}
