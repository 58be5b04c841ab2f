//! # Data Ingestors Module
//!
//! Long-running tasks that sit between the transport and the renderer. Each
//! ingestor owns its state, publishes results on a `watch` channel and stops
//! on a `CancellationToken`.
//!
//! ## Contained Modules:
//! - **`particle_feed`**: follows the current simulation over the streaming
//!   client, buffers its particles and publishes debounced evacuation zones.
//! - **`sensor_polling`**: a self-scheduling poller that fetches sensor
//!   snapshots through the query client and publishes clusters.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Streaming particle ingestion and zone publishing.
pub mod particle_feed;
/// Self-scheduling sensor snapshot poller.
pub mod sensor_polling;

// --- Public API Re-exports ---
pub use particle_feed::{ParticleFeed, ParticleFeedConfig, ReleasePoint, SimulationTarget, ZoneSnapshot};
pub use sensor_polling::{ClusterSnapshot, SensorPoller, SensorPollerConfig};
