//! # Streaming Transport Module
//!
//! One long-lived, multiplexed socket carrying many independent
//! subscriptions, kept alive across network failures.
//!
//! ## Purpose:
//! Consumers ask for a subscription and read events from it; they never see
//! the socket. The transport reconnects with backoff when the link drops and
//! replays every live subscription on the new link, so a handle obtained once
//! keeps receiving data for as long as it is held.
//!
//! ## Contained Modules:
//! - **`protocol`**: JSON frame shapes (`subscribe`, `unsubscribe`, `data`,
//!   `error`, `complete`).
//! - **`registry`**: id to query/variables/sink bookkeeping with replay order.
//! - **`connector`**: the `Connector` seam and the WebSocket implementation.
//! - **`memory`**: an in-process loopback connector for tests and demos.
//! - **`supervisor`**: the task owning state, retries and routing.
//! - **`subscription`**: the consumer-facing handle.
//! - **`client`**: `StreamClient`, the public entry point.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod client;
pub mod connector;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod subscription;
pub mod supervisor;

pub use client::{variables, StreamClient};
pub use connector::{Connector, Link, LinkEvent, WsConnector};
pub use memory::{MemoryConnector, MemoryServer, ServerEnd};
pub use registry::SUBSCRIPTION_QUEUE_CAPACITY;
pub use subscription::{Subscription, SubscriptionEvent, TypedSubscription};
pub use supervisor::{ConnectionState, ReconnectPolicy};
