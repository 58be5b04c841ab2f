//! # Sensor Polling Ingestor
//!
//! A self-scheduling poller for sensor snapshots. Sensor readings change
//! slowly and come from the one-shot query endpoint, so instead of a
//! subscription this task fetches a full snapshot, clusters it for the
//! configured zoom and publishes the result.
//!
//! ## Key Design Principles:
//! - **Self-Scheduling**: the loop sleeps `poll_interval` after a successful
//!   poll and `retry_delay` after a failed one.
//! - **Resilience**: a failed poll is logged and leaves the last published
//!   snapshot in place.
//! - **Cancellation**: sleeping and fetching both stop on the token.
//! - **Off the event loop**: clustering a large snapshot runs under
//!   `spawn_blocking`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::configs::CoreConfig;
use crate::errors::StreamError;
use crate::geo::{cluster_snapshot, Cluster, ClusterConfig, ClusterStrategy, SensorPoint};
use crate::retrieve::QueryClient;

/// Clusters published after each poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub clusters: Vec<Cluster>,
    pub point_count: usize,
    pub strategy: ClusterStrategy,
    pub captured_at_ms: i64,
}

impl ClusterSnapshot {
    /// Clusters `points` for `zoom` and stamps the result.
    pub fn from_points(points: &[SensorPoint], zoom: f64, config: &ClusterConfig) -> Self {
        let (clusters, strategy) = cluster_snapshot(points, zoom, config);
        Self {
            clusters,
            point_count: points.len(),
            strategy,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SensorsData {
    sensors: Vec<SensorPoint>,
}

/// Settings of a [`SensorPoller`].
#[derive(Debug, Clone, PartialEq)]
pub struct SensorPollerConfig {
    pub query: String,
    pub variables: Map<String, Value>,
    pub zoom: f64,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub clustering: ClusterConfig,
}

impl From<&CoreConfig> for SensorPollerConfig {
    fn from(c: &CoreConfig) -> Self {
        Self {
            query: c.sensor_query.clone(),
            variables: Map::new(),
            zoom: c.sensor_zoom,
            poll_interval: Duration::from_millis(c.sensor_poll_interval_ms),
            retry_delay: Duration::from_millis(c.sensor_retry_delay_ms),
            clustering: c.clustering.clone(),
        }
    }
}

/// Periodically fetches and clusters sensor snapshots.
pub struct SensorPoller {
    client: QueryClient,
    config: SensorPollerConfig,
    snapshots: watch::Sender<Option<ClusterSnapshot>>,
}

impl SensorPoller {
    /// Creates the poller and the receiver its snapshots are published on.
    /// The receiver holds `None` until the first successful poll.
    pub fn new(client: QueryClient, config: SensorPollerConfig) -> (Self, watch::Receiver<Option<ClusterSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                client,
                config,
                snapshots: tx,
            },
            rx,
        )
    }

    /// Fetches one snapshot, clusters it and publishes it. Clustering runs
    /// on the blocking pool.
    pub async fn poll_once(&self) -> Result<ClusterSnapshot, StreamError> {
        let data: SensorsData = self.client.execute(&self.config.query, &self.config.variables).await?;
        let zoom = self.config.zoom;
        let clustering = self.config.clustering.clone();
        let snapshot = tokio::task::spawn_blocking(move || ClusterSnapshot::from_points(&data.sensors, zoom, &clustering))
            .await
            .map_err(|e| StreamError::ComputationGuard(format!("Clustering task failed: {}", e)))?;
        log::debug!(
            "Clustered {} sensors into {} {:?} cluster(s).",
            snapshot.point_count,
            snapshot.clusters.len(),
            snapshot.strategy
        );
        self.snapshots.send_replace(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Poll loop. Returns when `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        log::info!("Sensor poller started against {}.", self.client.endpoint());

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            let delay = match outcome {
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    log::error!("Sensor poll failed: {}. Retrying in {}ms...", e, self.config.retry_delay.as_millis());
                    self.config.retry_delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("Sensor poller stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_preserves_the_point_count() {
        let points: Vec<SensorPoint> = (0..10)
            .map(|i| SensorPoint {
                id: i.to_string(),
                lat: 45.0 + i as f64 * 0.001,
                lon: 7.0,
                value: i as f64,
            })
            .collect();
        let snapshot = ClusterSnapshot::from_points(&points, 2.0, &ClusterConfig::default());

        assert_eq!(snapshot.point_count, 10);
        assert_eq!(snapshot.strategy, ClusterStrategy::Distance);
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.clusters[0].count, 10);
        assert!((snapshot.clusters[0].avg_value - 4.5).abs() < 1e-9);
    }

    #[test]
    fn config_follows_core_config() {
        let core = CoreConfig {
            sensor_poll_interval_ms: 1234,
            ..Default::default()
        };
        let config = SensorPollerConfig::from(&core);
        assert_eq!(config.poll_interval, Duration::from_millis(1234));
        assert_eq!(config.query, core.sensor_query);
    }
}
