//! # lib_radstream
//!
//! Streaming ingestion and geospatial aggregation core of the radiation
//! monitoring dashboard: one resilient multiplexed socket, a bounded particle
//! window, evacuation zone derivation and sensor clustering.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod configs;
pub mod errors;
pub mod geo;
pub mod transport;

#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use errors::StreamError;
