//! # Particle Buffer
//!
//! A FIFO window over streamed particle batches. Appends are cheap; once the
//! window holds more than `capacity` particles the oldest ones fall off the
//! front. Reads never mutate the window.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StreamError;

/// Default window size.
pub const DEFAULT_MAX_PARTICLES: usize = 10_000;

/// One dispersion particle. Positions are meters from the release point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Particle {
    #[serde(default)]
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    pub concentration: f64,
    #[serde(alias = "timestamp")]
    pub timestamp_ms: i64,
}

impl Particle {
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.concentration.is_finite()
    }
}

#[derive(Debug, Deserialize)]
struct ParticleBatch {
    particles: Vec<Particle>,
}

/// Capacity-bounded particle window.
#[derive(Debug, Clone)]
pub struct ParticleBuffer {
    particles: VecDeque<Particle>,
    capacity: usize,
    latest_timestamp: Option<i64>,
}

impl Default for ParticleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTICLES)
    }
}

impl ParticleBuffer {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            particles: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_PARTICLES)),
            capacity,
            latest_timestamp: None,
        }
    }

    /// Appends a batch in arrival order, then drops the oldest particles
    /// until the window fits its capacity.
    pub fn ingest(&mut self, batch: Vec<Particle>) {
        for particle in batch {
            self.latest_timestamp = Some(match self.latest_timestamp {
                Some(ts) => ts.max(particle.timestamp_ms),
                None => particle.timestamp_ms,
            });
            self.particles.push_back(particle);
        }

        let overflow = self.particles.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.particles.drain(..overflow);
        }
    }

    /// Parses a `{ "particles": [...] }` frame payload and ingests it.
    /// Returns how many particles were appended. A payload of the wrong
    /// shape leaves the buffer untouched.
    pub fn ingest_payload(&mut self, payload: &Value) -> Result<usize, StreamError> {
        let batch = ParticleBatch::deserialize(payload)
            .map_err(|e| StreamError::Protocol(format!("Invalid particle batch: {}", e)))?;
        let count = batch.particles.len();
        self.ingest(batch.particles);
        Ok(count)
    }

    /// All particles, or those with `start <= timestamp_ms <= end`, oldest
    /// first.
    pub fn query(&self, time_range: Option<(i64, i64)>) -> Vec<Particle> {
        match time_range {
            None => self.particles.iter().cloned().collect(),
            Some((start, end)) => self
                .particles
                .iter()
                .filter(|p| p.timestamp_ms >= start && p.timestamp_ms <= end)
                .cloned()
                .collect(),
        }
    }

    /// Borrowing view of the window, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Particle> + '_ {
        self.particles.iter()
    }

    /// Empties the window and forgets the latest timestamp.
    pub fn clear(&mut self) {
        self.particles.clear();
        self.latest_timestamp = None;
    }

    /// Newest timestamp ever ingested since the last `clear()`.
    pub fn latest_timestamp(&self) -> Option<i64> {
        self.latest_timestamp
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
