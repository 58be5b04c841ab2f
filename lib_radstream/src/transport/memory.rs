//! # In-Memory Loopback Transport
//!
//! A [`Connector`] that never touches the network. Each successful
//! `connect()` produces a [`ServerEnd`] that the other side (a test, a demo,
//! a replay tool) picks up through [`MemoryServer::accept`]. The connector
//! records the instant of every attempt and can be told to fail the next N
//! attempts, which is what the reconnect tests drive.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::StreamError;
use crate::transport::connector::{Connector, Link, LinkEvent};
use crate::transport::protocol::{ClientFrame, ServerFrame};

#[derive(Debug, Default)]
struct MemoryState {
    fail_next: u32,
    attempts: Vec<Instant>,
}

/// Client half of the loopback transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

/// Accepts the server ends of connections opened through a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(MemoryState::default())),
                accepted: tx,
            },
            MemoryServer { accepted: rx },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `n` connection attempts fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Instants of every connection attempt so far, successful or not.
    pub fn attempts(&self) -> Vec<Instant> {
        self.lock().attempts.clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> impl Future<Output = Result<Link, StreamError>> + Send {
        let outcome = {
            let mut state = self.lock();
            state.attempts.push(Instant::now());
            if state.fail_next > 0 {
                state.fail_next -= 1;
                Err(StreamError::Transport("Connection refused (simulated)".to_string()))
            } else {
                Ok(())
            }
        };
        let accepted = self.accepted.clone();

        async move {
            outcome?;

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            accepted
                .send(ServerEnd {
                    frames: out_rx,
                    events: Some(in_tx),
                })
                .map_err(|_| StreamError::Transport("Memory server is gone".to_string()))?;

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

impl MemoryServer {
    /// Waits for the next successfully opened connection.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }
}

/// Server side of one loopback connection.
#[derive(Debug)]
pub struct ServerEnd {
    frames: mpsc::UnboundedReceiver<String>,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl ServerEnd {
    /// Next raw text frame written by the client. `None` once the client
    /// dropped the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    /// Next client frame, parsed.
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Pushes a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        match &self.events {
            Some(tx) => tx.send(LinkEvent::Frame(text.into())).is_ok(),
            None => false,
        }
    }

    /// Pushes a server frame to the client.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Pushes a `data` frame.
    pub fn send_data(&self, id: &str, payload: Value) -> bool {
        self.send_frame(&ServerFrame::Data {
            id: id.to_string(),
            payload,
        })
    }

    /// Simulates the server dropping the connection.
    pub fn close(&mut self, reason: Option<&str>) {
        if let Some(tx) = self.events.take() {
            let _ = tx.send(LinkEvent::Closed(reason.map(str::to_string)));
        }
    }

    /// True once the client side dropped the link.
    pub fn is_client_gone(&self) -> bool {
        self.events.as_ref().map_or(true, |tx| tx.is_closed())
    }
}
