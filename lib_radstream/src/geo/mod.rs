//! # Geospatial Aggregation Module
//!
//! Pure functions that reduce streamed data to map-ready structures. Nothing
//! in here performs I/O or holds state between calls.
//!
//! ## Contained Modules:
//! - **`zones`**: severity-tiered evacuation polygons derived from a particle
//!   cloud, plus conversion and merging of server-provided zones.
//! - **`cluster`**: haversine and grid clustering of sensor snapshots.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Sensor point clustering.
pub mod cluster;
/// Evacuation zone derivation.
pub mod zones;

pub use cluster::{
    cluster_sensors, cluster_snapshot, grid_cluster, haversine_km, Cluster, ClusterConfig, ClusterStrategy, SensorPoint,
    GRID_COARSEN_FACTOR,
};
pub use zones::{
    derive_zones, merge_zones, parse_server_zones, EvacuationZone, Isotope, RawZone, Severity, SeverityThresholds,
    ZoneConfig, ZoneDeriver, ZoneSource,
};
