use anyhow::{Context, Result};
use clap::Parser;
use lib_radstream::configs::CoreConfig;
use lib_radstream::geo::{Isotope, ZoneSource};
use lib_radstream::ingestors::{ReleasePoint, SimulationTarget};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_plume.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Plume streaming gateway: evacuation zones and sensor clusters", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PLUME_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PLUME_CONFIG_DIR", help = "Directory holding config.global.json and server_plume[.<mode>].json.")]
    pub config_dir: Option<PathBuf>,

    #[clap(long, env = "PLUME_MODE", help = "Running mode used to pick server_plume.<mode>.json.")]
    pub mode: Option<String>,

    #[clap(long, env = "PLUME_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PLUME_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PLUME_STREAM_URL", help = "WebSocket endpoint carrying subscriptions.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "PLUME_QUERY_URL", help = "HTTP endpoint for one-shot queries.")]
    pub query_url: Option<String>,

    #[clap(long, env = "PLUME_AUTH_TOKEN", help = "Bearer token for the query endpoint.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "PLUME_SIMULATION_ID", help = "Simulation to follow.")]
    pub simulation_id: Option<String>,

    #[clap(long, env = "PLUME_RELEASE_LAT", help = "Release point latitude.", allow_hyphen_values = true)]
    pub release_lat: Option<f64>,

    #[clap(long, env = "PLUME_RELEASE_LON", help = "Release point longitude.", allow_hyphen_values = true)]
    pub release_lon: Option<f64>,

    #[clap(long, env = "PLUME_ISOTOPE", help = "Released isotope, e.g. Cs-137.")]
    pub isotope: Option<String>,

    #[clap(long, env = "PLUME_ZONE_SOURCE", help = "Zone source: client, server or merge.")]
    pub zone_source: Option<ZoneSource>,

    #[clap(long, env = "PLUME_OUTPUT_DIR", help = "Directory the latest zones.json and clusters.json are written to.")]
    pub output_dir: Option<PathBuf>,

    #[clap(long, env = "PLUME_SENSORS", help = "Enable the sensor poller.")]
    pub sensors: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            config_dir: other.config_dir.or(self.config_dir),
            mode: other.mode.or(self.mode),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            stream_url: other.stream_url.or(self.stream_url),
            query_url: other.query_url.or(self.query_url),
            auth_token: other.auth_token.or(self.auth_token),
            simulation_id: other.simulation_id.or(self.simulation_id),
            release_lat: other.release_lat.or(self.release_lat),
            release_lon: other.release_lon.or(self.release_lon),
            isotope: other.isotope.or(self.isotope),
            zone_source: other.zone_source.or(self.zone_source),
            output_dir: other.output_dir.or(self.output_dir),
            sensors: other.sensors.or(self.sensors),
        }
    }

    fn defaults() -> Config {
        Config {
            config_dir: Some(PathBuf::from(".")),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            isotope: Some("Cs-137".to_string()),
            sensors: Some(true),
            ..Default::default()
        }
    }

    /// The simulation to follow at startup, if one was configured.
    pub fn simulation_target(&self) -> Option<SimulationTarget> {
        let simulation_id = self.simulation_id.clone()?;
        let release = match (self.release_lat, self.release_lon) {
            (Some(lat), Some(lon)) => Some(ReleasePoint { lat, lon }),
            _ => None,
        };
        let isotope = Isotope::from(self.isotope.as_deref().unwrap_or("Cs-137"));
        Some(SimulationTarget::new(simulation_id, release, isotope))
    }

    /// Applies endpoint and zone overrides onto the core configuration.
    pub fn apply_to(&self, core: &mut CoreConfig) {
        if let Some(url) = &self.stream_url {
            core.stream_url = url.clone();
        }
        if let Some(url) = &self.query_url {
            core.query_url = url.clone();
        }
        if self.auth_token.is_some() {
            core.auth_token = self.auth_token.clone();
        }
        if let Some(source) = self.zone_source {
            core.zone_source = source;
        }
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Everything the gateway runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: Config,
    pub core: CoreConfig,
}

/// Defaults, then the JSON config file, then environment and CLI.
pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}

pub fn resolve(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if config_file_path.exists() {
        let text = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current = current.merge(file_config);
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }
    let server = current.merge(cli);

    let config_dir = server.config_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut core = CoreConfig::load_layered(&config_dir, "server_plume", server.mode.as_deref())
        .with_context(|| format!("Invalid core configuration in {}", config_dir.display()))?;
    server.apply_to(&mut core);
    core.validate().context("Invalid endpoint override")?;

    Ok(Settings { server, core })
}
