//! # Core Configuration
//!
//! `CoreConfig` gathers every tunable of the streaming core under one
//! camelCase JSON document. All fields have defaults, so an empty `{}` is a
//! valid configuration.
//!
//! Files are layered: `config.global.json` first, then `<name>.json`, then
//! `<name>.<mode>.json`, each overriding keys of the ones before it. Missing
//! files are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::buffer::DEFAULT_MAX_PARTICLES;
use crate::geo::{ClusterConfig, ZoneConfig, ZoneSource};
use crate::transport::ReconnectPolicy;

const CONFIG_GLOBAL_NAME: &str = "config.global.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every tunable of the streaming core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// WebSocket endpoint carrying the subscriptions.
    pub stream_url: String,
    /// HTTP endpoint for one-shot queries.
    pub query_url: String,
    pub auth_token: Option<String>,
    pub connect_timeout_ms: u64,
    #[serde(flatten)]
    pub reconnect: ReconnectPolicy,

    pub max_particles: usize,
    pub batch_size: u32,
    pub derive_interval_ms: u64,
    pub zone_source: ZoneSource,
    pub zones: ZoneConfig,

    pub clustering: ClusterConfig,
    pub sensor_zoom: f64,
    pub sensor_poll_interval_ms: u64,
    pub sensor_retry_delay_ms: u64,

    pub particle_query: String,
    pub zone_query: String,
    pub sensor_query: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://127.0.0.1:4000/graphql".to_string(),
            query_url: "http://127.0.0.1:4000/graphql".to_string(),
            auth_token: None,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            max_particles: DEFAULT_MAX_PARTICLES,
            batch_size: 500,
            derive_interval_ms: 500,
            zone_source: ZoneSource::default(),
            zones: ZoneConfig::default(),
            clustering: ClusterConfig::default(),
            sensor_zoom: 4.0,
            sensor_poll_interval_ms: 30_000,
            sensor_retry_delay_ms: 5_000,
            particle_query: "subscription ParticleBatches($simulationId: ID!, $batchSize: Int) { \
                particleBatch(simulationId: $simulationId, batchSize: $batchSize) { \
                particles { id x y z concentration timestamp } } }"
                .to_string(),
            zone_query: "subscription EvacuationZones($simulationId: ID!) { \
                evacuationZones(simulationId: $simulationId) { \
                zones { id name severity coordinates doseRate population instructions } } }"
                .to_string(),
            sensor_query: "query Sensors { sensors { id lat lon value } }".to_string(),
        }
    }
}

impl CoreConfig {
    /// Reads and validates a single JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let value = read_json(path)?;
        let config: CoreConfig = serde_json::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the layered files for `name` (and optionally `mode`) from `dir`.
    pub fn load_layered(dir: impl AsRef<Path>, name: &str, mode: Option<&str>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut layers = vec![dir.join(CONFIG_GLOBAL_NAME), dir.join(format!("{}.json", name))];
        if let Some(mode) = mode {
            layers.push(dir.join(format!("{}.{}.json", name, mode)));
        }

        let mut merged = Value::Object(Default::default());
        for layer in layers.iter().filter(|p| p.is_file()) {
            log::debug!("Applying config layer {}", layer.display());
            merge_json(&mut merged, read_json(layer)?);
        }

        let config: CoreConfig = serde_json::from_value(merged).map_err(|source| ConfigError::Parse {
            path: dir.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("streamUrl", &self.stream_url, &["ws", "wss"])?;
        check_scheme("queryUrl", &self.query_url, &["http", "https"])?;

        if self.max_particles == 0 {
            return Err(invalid("maxParticles", "must be at least 1"));
        }
        if !self.reconnect.backoff_multiplier.is_finite() || self.reconnect.backoff_multiplier < 1.0 {
            return Err(invalid("backoffMultiplier", "must be a finite number >= 1.0"));
        }
        if self.derive_interval_ms == 0 {
            return Err(invalid("deriveIntervalMs", "must be positive"));
        }
        if self.sensor_poll_interval_ms == 0 {
            return Err(invalid("sensorPollIntervalMs", "must be positive"));
        }
        if !self.sensor_zoom.is_finite() || self.sensor_zoom < 0.0 {
            return Err(invalid("sensorZoom", "must be a finite, non-negative zoom level"));
        }

        let t = &self.zones.thresholds;
        let ordered = [t.critical, t.high, t.medium, t.low];
        if ordered.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(invalid("zones.thresholds", "thresholds must be positive"));
        }
        if ordered.windows(2).any(|w| w[0] < w[1]) {
            return Err(invalid("zones.thresholds", "must not increase from critical to low"));
        }
        if !self.zones.population_density.is_finite() || self.zones.population_density < 0.0 {
            return Err(invalid("zones.populationDensity", "must be non-negative"));
        }
        if !self.clustering.base_radius_km.is_finite() || self.clustering.base_radius_km <= 0.0 {
            return Err(invalid("clustering.baseRadiusKm", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn check_scheme(field: &'static str, raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid(field, &format!("'{}' is not a URL: {}", raw, e)))?;
    if schemes.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(invalid(field, &format!("scheme must be one of {:?}", schemes)))
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursively overlays `overlay` onto `base`. Objects merge key by key;
/// everything else replaces.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                merge_json(base_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn empty_document_is_the_default() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_flattened_reconnect_keys() {
        let config: CoreConfig = serde_json::from_value(json!({
            "maxReconnectAttempts": 9,
            "reconnectIntervalMs": 250,
            "maxParticles": 42,
            "zoneSource": "merge",
            "zones": { "thresholds": { "critical": 500.0 } }
        }))
        .unwrap();

        assert_eq!(config.reconnect.max_reconnect_attempts, 9);
        assert_eq!(config.reconnect.reconnect_interval_ms, 250);
        assert_eq!(config.max_particles, 42);
        assert_eq!(config.zone_source, ZoneSource::Merge);
        assert_eq!(config.zones.thresholds.critical, 500.0);
        assert_eq!(config.zones.thresholds.high, 100.0);
    }

    #[test]
    fn layers_override_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.global.json", r#"{"maxParticles": 10, "batchSize": 7}"#);
        write(dir.path(), "server_plume.json", r#"{"maxParticles": 20}"#);
        write(dir.path(), "server_plume.dev.json", r#"{"zones": {"populationDensity": 5.0}}"#);

        let config = CoreConfig::load_layered(dir.path(), "server_plume", Some("dev")).unwrap();
        assert_eq!(config.max_particles, 20);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.zones.population_density, 5.0);
    }

    #[test]
    fn missing_layers_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::load_layered(dir.path(), "server_plume", None).unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn reports_io_and_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CoreConfig::from_file(dir.path().join("absent.json")),
            Err(ConfigError::Io { .. })
        ));

        write(dir.path(), "broken.json", "{ maxParticles: ");
        assert!(matches!(
            CoreConfig::from_file(dir.path().join("broken.json")),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = CoreConfig {
            stream_url: "http://example.org".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "streamUrl", .. })));

        config = CoreConfig::default();
        config.zones.thresholds.low = 5000.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "zones.thresholds", .. })));

        config = CoreConfig::default();
        config.max_particles = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_json_is_deep() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1]});
        merge_json(&mut base, json!({"a": {"c": 3}, "d": [2, 3]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": [2, 3]}));
    }
}
