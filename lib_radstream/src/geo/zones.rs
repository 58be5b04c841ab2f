//! # Evacuation Zone Deriver
//!
//! Turns a particle cloud into severity-tiered evacuation polygons.
//!
//! For every tier, CRITICAL first, the deriver keeps the particles whose dose
//! rate reaches the tier threshold, orders them by angle around their centroid
//! and projects that ring from local meters onto (lon, lat). Tiers are
//! cumulative: a particle hot enough for CRITICAL also counts toward HIGH,
//! MEDIUM and LOW.
//!
//! The ring is a star-shaped ordering of the qualifying particles, not a
//! convex hull. Derivation is a pure function of its inputs; the same
//! particles, release point, isotope and config always give the same zones.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::Particle;
use crate::errors::StreamError;

/// Meters per degree of latitude used by the local projection.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Lower bound for `cos(lat)` so the longitude projection stays finite.
pub const MIN_COS_LAT: f64 = 1e-6;

/// Fewest qualifying particles that still form a zone.
pub const MIN_ZONE_PARTICLES: usize = 3;

/// Evacuation zone tier, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Every tier in derivation order.
    pub const ALL: [Severity; 4] = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }

    /// Display name of the zone.
    pub fn zone_name(&self) -> &'static str {
        match self {
            Severity::Critical => "Critical Zone",
            Severity::High => "High Risk Zone",
            Severity::Medium => "Moderate Risk Zone",
            Severity::Low => "Low Risk Zone",
        }
    }

    /// Public guidance attached to every zone of this tier.
    pub fn instructions(&self) -> &'static str {
        match self {
            Severity::Critical => "Evacuate immediately. Follow designated evacuation routes.",
            Severity::High => "Shelter in place. Close windows and turn off ventilation.",
            Severity::Medium => "Monitor official channels and prepare to shelter if advised.",
            Severity::Low => "No protective action required. Stay informed.",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "HIGH" => Ok(Severity::High),
            "MEDIUM" => Ok(Severity::Medium),
            "LOW" => Ok(Severity::Low),
            other => Err(StreamError::Protocol(format!("Unknown severity '{}'", other))),
        }
    }
}

/// Released isotope. Unknown names are carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Isotope {
    Cs137,
    I131,
    Sr90,
    Co60,
    Pu239,
    Other(String),
}

impl Isotope {
    /// Canonical name, e.g. `Cs-137`.
    pub fn name(&self) -> &str {
        match self {
            Isotope::Cs137 => "Cs-137",
            Isotope::I131 => "I-131",
            Isotope::Sr90 => "Sr-90",
            Isotope::Co60 => "Co-60",
            Isotope::Pu239 => "Pu-239",
            Isotope::Other(name) => name,
        }
    }

    /// Built-in concentration to μSv/h factor. `None` for unknown isotopes.
    pub fn builtin_factor(&self) -> Option<f64> {
        match self {
            Isotope::Cs137 => Some(1.0e-4),
            Isotope::I131 => Some(2.2e-4),
            Isotope::Sr90 => Some(3.0e-5),
            Isotope::Co60 => Some(3.5e-4),
            Isotope::Pu239 => Some(5.0e-5),
            Isotope::Other(_) => None,
        }
    }
}

impl From<&str> for Isotope {
    fn from(s: &str) -> Self {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match key.as_str() {
            "CS137" => Isotope::Cs137,
            "I131" => Isotope::I131,
            "SR90" => Isotope::Sr90,
            "CO60" => Isotope::Co60,
            "PU239" => Isotope::Pu239,
            _ => Isotope::Other(s.trim().to_string()),
        }
    }
}

impl From<String> for Isotope {
    fn from(s: String) -> Self {
        Isotope::from(s.as_str())
    }
}

impl From<Isotope> for String {
    fn from(isotope: Isotope) -> Self {
        isotope.name().to_string()
    }
}

impl fmt::Display for Isotope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Minimum dose rate (μSv/h) per tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeverityThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: 1000.0,
            high: 100.0,
            medium: 10.0,
            low: 1.0,
        }
    }
}

impl SeverityThresholds {
    pub fn for_severity(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

/// Tunables for zone derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoneConfig {
    pub thresholds: SeverityThresholds,
    /// Per-isotope factor overrides keyed by isotope name (`Cs-137`, ...).
    pub conversion_factors: BTreeMap<String, f64>,
    /// Factor for isotopes with neither an override nor a built-in value.
    pub default_conversion_factor: f64,
    /// Persons per square degree of zone area.
    pub population_density: f64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            thresholds: SeverityThresholds::default(),
            conversion_factors: BTreeMap::new(),
            default_conversion_factor: 1.0e-4,
            population_density: 1000.0,
        }
    }
}

impl ZoneConfig {
    /// Resolves the conversion factor: override, then built-in, then default.
    pub fn conversion_factor(&self, isotope: &Isotope) -> f64 {
        self.conversion_factors
            .iter()
            .find(|(name, _)| Isotope::from(name.as_str()) == *isotope)
            .map(|(_, factor)| *factor)
            .or_else(|| isotope.builtin_factor())
            .unwrap_or(self.default_conversion_factor)
    }
}

/// Where the published zones come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneSource {
    /// Derived locally from the particle buffer.
    #[default]
    Client,
    /// Taken from the evacuation-zone subscription as-is.
    Server,
    /// Local zones, with a server zone replacing the local one of its tier.
    Merge,
}

impl FromStr for ZoneSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(ZoneSource::Client),
            "server" => Ok(ZoneSource::Server),
            "merge" => Ok(ZoneSource::Merge),
            other => Err(format!("unknown zone source '{}'", other)),
        }
    }
}

/// One evacuation polygon. `contour` is a closed ring of (lon, lat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationZone {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub contour: Vec<(f64, f64)>,
    pub dose_rate: f64,
    pub population: u64,
    pub instructions: String,
}

/// Zone as pushed on the evacuation-zone channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawZone {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub severity: String,
    #[serde(alias = "contour")]
    pub coordinates: Vec<(f64, f64)>,
    #[serde(default)]
    pub dose_rate: f64,
    #[serde(default)]
    pub population: Option<u64>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl TryFrom<RawZone> for EvacuationZone {
    type Error = StreamError;

    fn try_from(raw: RawZone) -> Result<Self, Self::Error> {
        let severity: Severity = raw.severity.parse()?;
        let mut contour = raw.coordinates;
        if let (Some(first), Some(last)) = (contour.first().copied(), contour.last().copied()) {
            if first != last {
                contour.push(first);
            }
        }

        Ok(EvacuationZone {
            id: raw.id.unwrap_or_else(|| format!("server-zone-{}", severity.as_str().to_ascii_lowercase())),
            name: raw.name.unwrap_or_else(|| severity.zone_name().to_string()),
            severity,
            contour,
            dose_rate: round2(raw.dose_rate),
            population: raw.population.unwrap_or(0),
            instructions: raw.instructions.unwrap_or_else(|| severity.instructions().to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ZoneBatch {
    zones: Vec<RawZone>,
}

/// Parses a `{ "zones": [...] }` payload from the evacuation-zone channel.
pub fn parse_server_zones(payload: &Value) -> Result<Vec<EvacuationZone>, StreamError> {
    let batch = ZoneBatch::deserialize(payload)
        .map_err(|e| StreamError::Protocol(format!("Invalid zone batch: {}", e)))?;
    batch.zones.into_iter().map(EvacuationZone::try_from).collect()
}

/// Combines locally derived and server-provided zones. Output is ordered by
/// severity, most severe first.
pub fn merge_zones(client: Vec<EvacuationZone>, server: Vec<EvacuationZone>, source: ZoneSource) -> Vec<EvacuationZone> {
    let mut zones = match source {
        ZoneSource::Client => client,
        ZoneSource::Server => server,
        ZoneSource::Merge => {
            let mut merged: Vec<EvacuationZone> = client
                .into_iter()
                .filter(|c| !server.iter().any(|s| s.severity == c.severity))
                .collect();
            merged.extend(server);
            merged
        }
    };
    zones.sort_by_key(|z| z.severity);
    zones
}

/// Derives zones with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct ZoneDeriver {
    config: ZoneConfig,
}

impl ZoneDeriver {
    pub fn new(config: ZoneConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Derives every tier that has enough qualifying particles.
    ///
    /// Returns an empty list when there are no particles or the release
    /// point is missing. Non-finite particles are skipped.
    pub fn derive_zones<'a, I>(
        &self,
        particles: I,
        release_lat: Option<f64>,
        release_lon: Option<f64>,
        isotope: &Isotope,
    ) -> Vec<EvacuationZone>
    where
        I: IntoIterator<Item = &'a Particle>,
    {
        let (Some(lat0), Some(lon0)) = (release_lat, release_lon) else {
            return Vec::new();
        };
        if !lat0.is_finite() || !lon0.is_finite() {
            log::warn!("Ignoring non-finite release point ({}, {})", lat0, lon0);
            return Vec::new();
        }

        let factor = self.config.conversion_factor(isotope);
        let doses: Vec<(f64, f64, f64)> = particles
            .into_iter()
            .filter(|p| p.is_finite())
            .map(|p| (p.x, p.y, p.concentration * factor))
            .filter(|(_, _, dose)| dose.is_finite())
            .collect();
        if doses.is_empty() {
            return Vec::new();
        }

        let cos_lat = lat0.to_radians().cos().abs().max(MIN_COS_LAT);

        Severity::ALL
            .iter()
            .filter_map(|&severity| {
                let threshold = self.config.thresholds.for_severity(severity);
                let tier: Vec<(f64, f64, f64)> = doses.iter().copied().filter(|(_, _, d)| *d >= threshold).collect();
                self.build_zone(severity, &tier, lat0, lon0, cos_lat)
            })
            .collect()
    }

    fn build_zone(
        &self,
        severity: Severity,
        tier: &[(f64, f64, f64)],
        lat0: f64,
        lon0: f64,
        cos_lat: f64,
    ) -> Option<EvacuationZone> {
        if tier.len() < MIN_ZONE_PARTICLES {
            return None;
        }

        let n = tier.len() as f64;
        let cx = tier.iter().map(|(x, _, _)| x).sum::<f64>() / n;
        let cy = tier.iter().map(|(_, y, _)| y).sum::<f64>() / n;
        if !cx.is_finite() || !cy.is_finite() {
            let guard = StreamError::ComputationGuard(format!("non-finite centroid for {} tier", severity));
            log::warn!("{}; tier skipped.", guard);
            return None;
        }

        let mut ring: Vec<(f64, f64)> = tier.iter().map(|(x, y, _)| (*x, *y)).collect();
        ring.sort_by(|a, b| {
            let ta = (a.1 - cy).atan2(a.0 - cx);
            let tb = (b.1 - cy).atan2(b.0 - cx);
            ta.total_cmp(&tb)
        });

        let mut contour: Vec<(f64, f64)> = ring
            .iter()
            .map(|(x, y)| {
                let lat = lat0 + y / METERS_PER_DEGREE;
                let lon = lon0 + (x / METERS_PER_DEGREE) / cos_lat;
                (lon, lat)
            })
            .collect();
        contour.push(contour[0]);

        let max_radius = ring
            .iter()
            .map(|(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt() / METERS_PER_DEGREE)
            .fold(0.0_f64, f64::max);
        let population = (PI * max_radius * max_radius * self.config.population_density).round();
        let mean_dose = tier.iter().map(|(_, _, d)| d).sum::<f64>() / n;

        Some(EvacuationZone {
            id: format!("zone-{}", severity.as_str().to_ascii_lowercase()),
            name: severity.zone_name().to_string(),
            severity,
            contour,
            dose_rate: round2(mean_dose),
            population: if population.is_finite() && population > 0.0 { population as u64 } else { 0 },
            instructions: severity.instructions().to_string(),
        })
    }
}

/// [`ZoneDeriver::derive_zones`] with the default configuration.
pub fn derive_zones(
    particles: &[Particle],
    release_lat: Option<f64>,
    release_lon: Option<f64>,
    isotope: &Isotope,
) -> Vec<EvacuationZone> {
    ZoneDeriver::default().derive_zones(particles, release_lat, release_lon, isotope)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
