//! # Error Taxonomy
//!
//! Every fallible operation in the streaming core reports a [`StreamError`].
//! The variants mirror the failure classes of the data plane:
//!
//! - **`Transport`**: the socket could not be constructed or opened, or the
//!   reconnect budget ran out.
//! - **`Protocol`**: a frame or batch did not have the expected shape.
//! - **`Subscription`**: the server reported an error for one subscription id.
//! - **`ComputationGuard`**: degenerate geometry met during zone derivation,
//!   or a clustering task that died on the blocking pool. The deriver
//!   defends against these inline and only uses the variant for logging.
//! - **`Request`**: a one-shot query failed.
//! - **`Closed`**: the client task that owned the connection is gone.
//!
//! `StreamError` is `Clone` because a single transport failure fans out to
//! every registered subscription.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the streaming ingestion core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription {id} failed: {payload}")]
    Subscription { id: String, payload: Value },

    #[error("Computation guard tripped: {0}")]
    ComputationGuard(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Stream client is shut down")]
    Closed,
}

impl StreamError {
    /// Returns true for failures of the underlying connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Protocol(e.to_string())
    }
}
