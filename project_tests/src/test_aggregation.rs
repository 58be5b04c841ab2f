//! # Aggregation Pipeline Tests
//!
//! Exercises the path a particle batch takes from the wire payload through
//! the bounded buffer into evacuation zones, and the sensor clustering used
//! for the map overlay, through the public API only.

#![forbid(unsafe_code)]

use lib_radstream::buffer::ParticleBuffer;
use lib_radstream::geo::{
    cluster_sensors, cluster_snapshot, merge_zones, parse_server_zones, ClusterConfig, ClusterStrategy, Isotope,
    SensorPoint, Severity, ZoneConfig, ZoneDeriver, ZoneSource,
};
use serde_json::json;

fn batch(start: i64, count: i64, concentration: f64) -> serde_json::Value {
    let particles: Vec<_> = (start..start + count)
        .map(|i| {
            json!({
                "id": format!("p{}", i),
                "x": (i % 5) as f64 * 40.0 - 80.0,
                "y": (i % 3) as f64 * 40.0 - 40.0,
                "z": 10.0,
                "concentration": concentration,
                "timestamp": 1_700_000_000_000_i64 + i
            })
        })
        .collect();
    json!({ "particles": particles })
}

#[test]
fn high_dose_cloud_yields_high_but_not_critical() {
    let mut buffer = ParticleBuffer::new(100);
    assert_eq!(buffer.ingest_payload(&batch(0, 5, 1_000_000.0)).unwrap(), 5);

    let deriver = ZoneDeriver::new(ZoneConfig::default());
    let zones = deriver.derive_zones(buffer.iter(), Some(51.39), Some(30.09), &Isotope::from("Cs-137"));
    let severities: Vec<Severity> = zones.iter().map(|z| z.severity).collect();

    assert_eq!(severities, vec![Severity::High, Severity::Medium, Severity::Low]);
    let high = &zones[0];
    assert_eq!(high.dose_rate, 100.0);
    assert_eq!(high.contour.first(), high.contour.last());
    assert_eq!(high.contour.len(), 6);
    for (lon, lat) in &high.contour {
        assert!((lat - 51.39).abs() < 0.01 && (lon - 30.09).abs() < 0.01);
    }
}

#[test]
fn window_keeps_most_recent_particles() {
    let mut buffer = ParticleBuffer::new(5);
    for round in 0..3 {
        buffer.ingest_payload(&batch(round * 3, 3, 1.0)).unwrap();
    }

    let ids: Vec<String> = buffer.query(None).into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["p4", "p5", "p6", "p7", "p8"]);
    assert_eq!(buffer.latest_timestamp(), Some(1_700_000_000_008));

    let ranged = buffer.query(Some((1_700_000_000_005, 1_700_000_000_006)));
    assert_eq!(ranged.len(), 2);
}

#[test]
fn malformed_batch_leaves_buffer_untouched() {
    let mut buffer = ParticleBuffer::new(10);
    buffer.ingest_payload(&batch(0, 4, 1.0)).unwrap();
    assert!(buffer.ingest_payload(&json!({ "particles": [{ "x": "east" }] })).is_err());
    assert!(buffer.ingest_payload(&json!({ "zones": [] })).is_err());
    assert_eq!(buffer.len(), 4);
}

#[test]
fn too_few_particles_or_no_release_point_gives_nothing() {
    let mut buffer = ParticleBuffer::new(10);
    buffer.ingest_payload(&batch(0, 2, 1.0e9)).unwrap();
    let deriver = ZoneDeriver::default();
    assert!(deriver.derive_zones(buffer.iter(), Some(0.0), Some(0.0), &Isotope::Cs137).is_empty());

    buffer.ingest_payload(&batch(2, 3, 1.0e9)).unwrap();
    assert!(deriver.derive_zones(buffer.iter(), None, Some(0.0), &Isotope::Cs137).is_empty());
    assert_eq!(deriver.derive_zones(buffer.iter(), Some(0.0), Some(0.0), &Isotope::Cs137).len(), 4);
}

#[test]
fn server_zones_replace_client_tiers_when_merging() {
    let mut buffer = ParticleBuffer::new(10);
    buffer.ingest_payload(&batch(0, 5, 1_000_000.0)).unwrap();
    let client = ZoneDeriver::default().derive_zones(buffer.iter(), Some(10.0), Some(10.0), &Isotope::Cs137);

    let server = parse_server_zones(&json!({ "zones": [{
        "id": "official-high",
        "severity": "high",
        "coordinates": [[10.0, 10.0], [10.1, 10.0], [10.1, 10.1]],
        "doseRate": 250.0
    }] }))
    .unwrap();

    let merged = merge_zones(client.clone(), server.clone(), ZoneSource::Merge);
    assert_eq!(merged.len(), client.len());
    assert_eq!(merged[0].id, "official-high");
    assert_eq!(merged[0].contour.len(), 4);

    assert_eq!(merge_zones(client.clone(), server.clone(), ZoneSource::Client), client);
    assert_eq!(merge_zones(client, server.clone(), ZoneSource::Server), server);
}

fn sensor(lat: f64, lon: f64, value: f64) -> SensorPoint {
    SensorPoint {
        id: String::new(),
        lat,
        lon,
        value,
    }
}

#[test]
fn zoom_decides_whether_nearby_sensors_merge() {
    let points = vec![sensor(48.0, 11.0, 2.0), sensor(48.45, 11.0, 4.0)];

    let far = cluster_sensors(&points, 2.0, None);
    assert_eq!(far.len(), 1);
    assert_eq!(far[0].count, 2);
    assert!((far[0].avg_value - 3.0).abs() < 1e-9);

    let near = cluster_sensors(&points, 10.0, None);
    assert_eq!(near.len(), 2);
    assert!(near.iter().all(|c| c.count == 1));
}

#[test]
fn large_snapshot_uses_grid_and_respects_cap() {
    let points: Vec<SensorPoint> = (0..400)
        .map(|i| sensor(-50.0 + (i % 20) as f64 * 5.0, -150.0 + (i / 20) as f64 * 15.0, 1.0))
        .collect();
    let config = ClusterConfig {
        max_clusters: Some(40),
        ..Default::default()
    };

    let (clusters, strategy) = cluster_snapshot(&points, 6.0, &config);
    assert_eq!(strategy, ClusterStrategy::Grid);
    assert!(clusters.len() <= 40);
    assert_eq!(clusters.iter().map(|c| c.count).sum::<usize>(), 400);
}
