//! # Streaming Buffer Module
//!
//! Holds the rolling window of particles streamed for the simulation that is
//! currently being followed.
//!
//! ## Contained Modules:
//! - **`particle_buffer`**: `Particle` plus the capacity-bounded
//!   `ParticleBuffer` (drop-oldest on overflow, optional time-range reads).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Capacity-bounded particle window.
pub mod particle_buffer;

pub use particle_buffer::{Particle, ParticleBuffer, DEFAULT_MAX_PARTICLES};
