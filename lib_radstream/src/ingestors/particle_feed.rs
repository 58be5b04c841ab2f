//! # Particle Feed Ingestor
//!
//! Long-running task that follows one simulation at a time and keeps an
//! up-to-date set of evacuation zones for it.
//!
//! ## Workflow:
//! 1.  **Follow the target**: the simulation to follow arrives on a `watch`
//!     channel. A new simulation id clears the buffer, closes the previous
//!     subscriptions and opens fresh ones.
//! 2.  **Ingest**: particle batches are appended to the bounded buffer.
//!     Malformed batches are logged and dropped.
//! 3.  **Debounced derivation**: zones are derived at most once per
//!     `derive_interval`, and only after new data arrived.
//! 4.  **Publish**: every derivation replaces the `ZoneSnapshot` on the
//!     output `watch` channel.
//!
//! The feed only talks to the `StreamClient` handle, so reconnects are
//! invisible to it: its subscriptions are replayed by the supervisor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::ParticleBuffer;
use crate::configs::CoreConfig;
use crate::geo::{merge_zones, parse_server_zones, EvacuationZone, Isotope, ZoneConfig, ZoneDeriver, ZoneSource};
use crate::transport::{variables, StreamClient, Subscription, SubscriptionEvent};

/// Release location of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReleasePoint {
    pub lat: f64,
    pub lon: f64,
}

/// The simulation a feed follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTarget {
    pub simulation_id: String,
    pub release: Option<ReleasePoint>,
    pub isotope: Isotope,
}

impl SimulationTarget {
    pub fn new(simulation_id: impl Into<String>, release: Option<ReleasePoint>, isotope: Isotope) -> Self {
        Self {
            simulation_id: simulation_id.into(),
            release,
            isotope,
        }
    }
}

/// Zones published after each derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSnapshot {
    pub simulation_id: Option<String>,
    pub zones: Vec<EvacuationZone>,
    pub particle_count: usize,
    pub derived_at_ms: i64,
}

impl ZoneSnapshot {
    pub fn empty(simulation_id: Option<String>) -> Self {
        Self {
            simulation_id,
            zones: Vec::new(),
            particle_count: 0,
            derived_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Settings of a [`ParticleFeed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleFeedConfig {
    pub particle_query: String,
    pub zone_query: String,
    pub batch_size: u32,
    pub max_particles: usize,
    pub derive_interval: Duration,
    pub zone_source: ZoneSource,
    pub zones: ZoneConfig,
}

impl From<&CoreConfig> for ParticleFeedConfig {
    fn from(c: &CoreConfig) -> Self {
        Self {
            particle_query: c.particle_query.clone(),
            zone_query: c.zone_query.clone(),
            batch_size: c.batch_size,
            max_particles: c.max_particles,
            derive_interval: Duration::from_millis(c.derive_interval_ms.max(1)),
            zone_source: c.zone_source,
            zones: c.zones.clone(),
        }
    }
}

#[derive(Default)]
struct ActiveStreams {
    particles: Option<Subscription>,
    zones: Option<Subscription>,
}

/// Streams particles for the current simulation and publishes its zones.
pub struct ParticleFeed {
    client: StreamClient,
    config: ParticleFeedConfig,
    deriver: ZoneDeriver,
    buffer: ParticleBuffer,
    server_zones: Vec<EvacuationZone>,
    snapshots: watch::Sender<ZoneSnapshot>,
}

impl ParticleFeed {
    /// Creates the feed and the receiver its snapshots are published on.
    pub fn new(client: StreamClient, config: ParticleFeedConfig) -> (Self, watch::Receiver<ZoneSnapshot>) {
        let (tx, rx) = watch::channel(ZoneSnapshot::empty(None));
        let feed = Self {
            client,
            deriver: ZoneDeriver::new(config.zones.clone()),
            buffer: ParticleBuffer::new(config.max_particles),
            server_zones: Vec::new(),
            config,
            snapshots: tx,
        };
        (feed, rx)
    }

    /// Main loop. Returns when `cancel` fires or the target sender is dropped.
    pub async fn run(mut self, mut targets: watch::Receiver<Option<SimulationTarget>>, cancel: CancellationToken) {
        let mut current = targets.borrow_and_update().clone();
        let mut streams = self.open(current.as_ref());
        let mut dirty = false;

        let mut ticker = tokio::time::interval(self.config.derive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Particle feed started (zone source: {:?}).", self.config.zone_source);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Particle feed cancelled.");
                    break;
                }
                changed = targets.changed() => {
                    if changed.is_err() {
                        log::info!("Simulation target channel closed; particle feed stopping.");
                        break;
                    }
                    let next = targets.borrow_and_update().clone();
                    let same_simulation = next.as_ref().map(|t| &t.simulation_id) == current.as_ref().map(|t| &t.simulation_id);

                    if same_simulation {
                        // Release point or isotope changed; re-derive on the next tick.
                        dirty |= next != current;
                    } else {
                        log::info!(
                            "Switching simulation: {:?} -> {:?}",
                            current.as_ref().map(|t| t.simulation_id.as_str()),
                            next.as_ref().map(|t| t.simulation_id.as_str())
                        );
                        self.buffer.clear();
                        self.server_zones.clear();
                        // Close the old channels before opening the new ones.
                        drop(std::mem::take(&mut streams));
                        streams = self.open(next.as_ref());
                        self.snapshots.send_replace(ZoneSnapshot::empty(next.as_ref().map(|t| t.simulation_id.clone())));
                        dirty = false;
                    }
                    current = next;
                }
                event = next_event(&mut streams.particles) => match event {
                    Some(event) => dirty |= self.on_particles(event),
                    None => streams.particles = None,
                },
                event = next_event(&mut streams.zones) => match event {
                    Some(event) => dirty |= self.on_zones(event),
                    None => streams.zones = None,
                },
                _ = ticker.tick() => {
                    if dirty {
                        self.publish(current.as_ref());
                        dirty = false;
                    }
                }
            }
        }
    }

    fn open(&self, target: Option<&SimulationTarget>) -> ActiveStreams {
        let Some(target) = target else {
            return ActiveStreams::default();
        };

        let particles = self.client.subscribe(
            &self.config.particle_query,
            variables(json!({
                "simulationId": target.simulation_id,
                "batchSize": self.config.batch_size,
            })),
        );
        let zones = (self.config.zone_source != ZoneSource::Client).then(|| {
            self.client.subscribe(
                &self.config.zone_query,
                variables(json!({ "simulationId": target.simulation_id })),
            )
        });

        ActiveStreams {
            particles: Some(particles),
            zones,
        }
    }

    fn on_particles(&mut self, event: SubscriptionEvent) -> bool {
        match event {
            SubscriptionEvent::Data(payload) => match self.buffer.ingest_payload(&payload) {
                Ok(count) => {
                    log::trace!("Ingested {} particles ({} buffered).", count, self.buffer.len());
                    count > 0
                }
                Err(e) => {
                    log::warn!("{}; batch dropped.", e);
                    false
                }
            },
            SubscriptionEvent::Error(e) => {
                log::warn!("Particle stream error: {}", e);
                false
            }
            SubscriptionEvent::Complete => {
                log::info!("Particle stream completed by server.");
                false
            }
        }
    }

    fn on_zones(&mut self, event: SubscriptionEvent) -> bool {
        match event {
            SubscriptionEvent::Data(payload) => match parse_server_zones(&payload) {
                Ok(zones) => {
                    self.server_zones = zones;
                    true
                }
                Err(e) => {
                    log::warn!("{}; zone batch dropped.", e);
                    false
                }
            },
            SubscriptionEvent::Error(e) => {
                log::warn!("Zone stream error: {}", e);
                false
            }
            SubscriptionEvent::Complete => false,
        }
    }

    fn publish(&self, target: Option<&SimulationTarget>) {
        let client_zones = match target {
            Some(t) if self.config.zone_source != ZoneSource::Server => self.deriver.derive_zones(
                self.buffer.iter(),
                t.release.map(|r| r.lat),
                t.release.map(|r| r.lon),
                &t.isotope,
            ),
            _ => Vec::new(),
        };

        let zones = merge_zones(client_zones, self.server_zones.clone(), self.config.zone_source);
        log::debug!("Derived {} zone(s) from {} particles.", zones.len(), self.buffer.len());

        self.snapshots.send_replace(ZoneSnapshot {
            simulation_id: target.map(|t| t.simulation_id.clone()),
            zones,
            particle_count: self.buffer.len(),
            derived_at_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}

async fn next_event(sub: &mut Option<Subscription>) -> Option<SubscriptionEvent> {
    match sub {
        Some(sub) => sub.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Severity;
    use crate::transport::memory::ServerEnd;
    use crate::transport::protocol::ClientFrame;
    use crate::transport::{MemoryConnector, ReconnectPolicy};

    fn feed_config(zone_source: ZoneSource) -> ParticleFeedConfig {
        ParticleFeedConfig {
            particle_query: "particles".to_string(),
            zone_query: "zones".to_string(),
            batch_size: 100,
            max_particles: 50,
            derive_interval: Duration::from_millis(200),
            zone_source,
            zones: ZoneConfig::default(),
        }
    }

    fn hot_batch() -> serde_json::Value {
        json!({
            "particles": [
                { "x": 100.0, "y": 100.0, "concentration": 2.0e7, "timestamp": 1 },
                { "x": -100.0, "y": 100.0, "concentration": 2.0e7, "timestamp": 2 },
                { "x": 0.0, "y": -100.0, "concentration": 2.0e7, "timestamp": 3 }
            ]
        })
    }

    async fn next_subscribe(end: &mut ServerEnd) -> (String, String, serde_json::Map<String, serde_json::Value>) {
        loop {
            match end.recv_frame().await {
                Some(ClientFrame::Subscribe { id, payload }) => return (id, payload.query, payload.variables),
                Some(_) => continue,
                None => panic!("client went away"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn derives_and_switches_simulations() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, ReconnectPolicy::default());
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let target = SimulationTarget::new("sim-1", Some(ReleasePoint { lat: 40.0, lon: -3.0 }), Isotope::Cs137);
        let (target_tx, target_rx) = watch::channel(Some(target));
        let (feed, mut snapshots) = ParticleFeed::new(client.clone(), feed_config(ZoneSource::Client));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(feed.run(target_rx, cancel.clone()));

        let (id, query, vars) = next_subscribe(&mut end).await;
        assert_eq!(query, "particles");
        assert_eq!(vars.get("simulationId"), Some(&json!("sim-1")));
        assert_eq!(vars.get("batchSize"), Some(&json!(100)));

        end.send_data(&id, hot_batch());
        let snapshot = snapshots.wait_for(|s| !s.zones.is_empty()).await.unwrap().clone();
        assert_eq!(snapshot.simulation_id.as_deref(), Some("sim-1"));
        assert_eq!(snapshot.particle_count, 3);
        assert_eq!(snapshot.zones[0].severity, Severity::Critical);

        target_tx
            .send(Some(SimulationTarget::new("sim-2", Some(ReleasePoint { lat: 0.0, lon: 0.0 }), Isotope::I131)))
            .unwrap();

        assert_eq!(end.recv_frame().await, Some(ClientFrame::Unsubscribe { id }));
        let (_, _, vars) = next_subscribe(&mut end).await;
        assert_eq!(vars.get("simulationId"), Some(&json!("sim-2")));

        let snapshot = snapshots
            .wait_for(|s| s.simulation_id.as_deref() == Some("sim-2"))
            .await
            .unwrap()
            .clone();
        assert!(snapshot.zones.is_empty());
        assert_eq!(snapshot.particle_count, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_batches_are_dropped() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, ReconnectPolicy::default());
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let target = SimulationTarget::new("sim-1", Some(ReleasePoint { lat: 1.0, lon: 1.0 }), Isotope::Cs137);
        let (_target_tx, target_rx) = watch::channel(Some(target));
        let (feed, mut snapshots) = ParticleFeed::new(client, feed_config(ZoneSource::Client));
        let cancel = CancellationToken::new();
        tokio::spawn(feed.run(target_rx, cancel.clone()));

        let (id, _, _) = next_subscribe(&mut end).await;
        end.send_data(&id, json!({ "particles": "garbage" }));
        end.send_data(&id, hot_batch());

        let snapshot = snapshots.wait_for(|s| s.particle_count > 0).await.unwrap().clone();
        assert_eq!(snapshot.particle_count, 3);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn merge_mode_uses_server_zones() {
        let (connector, mut server) = MemoryConnector::new();
        let client = StreamClient::spawn(connector, ReconnectPolicy::default());
        client.connect().unwrap();
        let mut end = server.accept().await.unwrap();

        let target = SimulationTarget::new("sim-9", Some(ReleasePoint { lat: 1.0, lon: 1.0 }), Isotope::Cs137);
        let (_target_tx, target_rx) = watch::channel(Some(target));
        let (feed, mut snapshots) = ParticleFeed::new(client, feed_config(ZoneSource::Merge));
        let cancel = CancellationToken::new();
        tokio::spawn(feed.run(target_rx, cancel.clone()));

        let (particle_id, _, _) = next_subscribe(&mut end).await;
        let (zone_id, zone_query, _) = next_subscribe(&mut end).await;
        assert_eq!(zone_query, "zones");

        end.send_data(&particle_id, hot_batch());
        end.send_data(
            &zone_id,
            json!({ "zones": [{ "id": "srv-low", "severity": "LOW", "coordinates": [[0.0, 0.0], [1.0, 1.0], [1.0, 0.0]] }] }),
        );

        let snapshot = snapshots
            .wait_for(|s| s.zones.iter().any(|z| z.id == "srv-low") && s.particle_count == 3)
            .await
            .unwrap()
            .clone();
        let tiers: Vec<Severity> = snapshot.zones.iter().map(|z| z.severity).collect();
        assert_eq!(tiers, vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low]);
        assert_eq!(snapshot.zones.iter().filter(|z| z.severity == Severity::Low).count(), 1);
        cancel.cancel();
    }
}
