//! # Wire Protocol
//!
//! JSON text frames exchanged over the single multiplexed socket. Every frame
//! carries a `type` discriminator and, apart from connection-level frames, the
//! subscription `id` it belongs to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::StreamError;

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Opens (or re-opens after a reconnect) a subscription.
    Subscribe { id: String, payload: SubscribePayload },
    /// Cancels a subscription.
    Unsubscribe { id: String },
}

/// Body of a `subscribe` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Data { id: String, payload: Value },
    Error {
        id: String,
        #[serde(default)]
        payload: Value,
    },
    Complete { id: String },
}

impl ServerFrame {
    /// The subscription id the frame is addressed to.
    pub fn id(&self) -> &str {
        match self {
            ServerFrame::Data { id, .. } | ServerFrame::Error { id, .. } | ServerFrame::Complete { id } => id,
        }
    }
}

impl ClientFrame {
    /// Builds a `subscribe` frame.
    pub fn subscribe(id: &str, query: &str, variables: &Map<String, Value>) -> Self {
        ClientFrame::Subscribe {
            id: id.to_string(),
            payload: SubscribePayload {
                query: query.to_string(),
                variables: variables.clone(),
            },
        }
    }

    /// Builds an `unsubscribe` frame.
    pub fn unsubscribe(id: &str) -> Self {
        ClientFrame::Unsubscribe { id: id.to_string() }
    }

    /// Serializes the frame to the JSON text sent on the wire.
    pub fn to_text(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parses an inbound text frame. Anything that is not a well-formed
/// `data`/`error`/`complete` frame is a protocol error.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, StreamError> {
    serde_json::from_str::<ServerFrame>(text)
        .map_err(|e| StreamError::Protocol(format!("Malformed server frame: {}", e)))
}
