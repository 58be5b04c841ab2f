//! # Spatial Clustering Engine
//!
//! Reduces a sensor snapshot to a number of aggregates a map can draw.
//!
//! Two strategies share one contract: every input point lands in exactly one
//! cluster, so the counts always add up to the input length.
//!
//! - **Distance** (`cluster_sensors`): a greedy haversine scan whose radius
//!   halves with every zoom level.
//! - **Grid** (`grid_cluster`): points are bucketed by truncated lat/lon.
//!   Linear time, used for large snapshots.
//!
//! Both finish by merging the two closest clusters (count-weighted) until the
//! optional cap is met. The grid coarsens its cells first when they far
//! outnumber the cap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine distance.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance radius at zoom 0.
pub const DEFAULT_BASE_RADIUS_KM: f64 = 500.0;

/// Snapshot size above which `cluster_snapshot` switches to the grid.
pub const DEFAULT_GRID_THRESHOLD: usize = 300;

/// Grid cells allowed per capped cluster before the grid is coarsened.
pub const GRID_COARSEN_FACTOR: usize = 4;

/// One sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPoint {
    #[serde(default)]
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub value: f64,
}

/// Aggregate of one or more sensor points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub lat: f64,
    pub lon: f64,
    pub count: usize,
    pub avg_value: f64,
}

impl Cluster {
    fn merge(&self, other: &Cluster) -> Cluster {
        let a = self.count as f64;
        let b = other.count as f64;
        let n = a + b;
        Cluster {
            lat: (self.lat * a + other.lat * b) / n,
            lon: (self.lon * a + other.lon * b) / n,
            count: self.count + other.count,
            avg_value: (self.avg_value * a + other.avg_value * b) / n,
        }
    }
}

/// Strategy picked by [`cluster_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStrategy {
    Distance,
    Grid,
}

/// Clustering tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub base_radius_km: f64,
    /// Decimal places kept by the grid key.
    pub precision: u32,
    pub max_clusters: Option<usize>,
    pub grid_threshold: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_radius_km: DEFAULT_BASE_RADIUS_KM,
            precision: 1,
            max_clusters: Some(200),
            grid_threshold: DEFAULT_GRID_THRESHOLD,
        }
    }
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance clustering with the default base radius.
pub fn cluster_sensors(points: &[SensorPoint], zoom: f64, max_clusters: Option<usize>) -> Vec<Cluster> {
    cluster_with_radius(points, DEFAULT_BASE_RADIUS_KM / 2f64.powf(zoom), max_clusters)
}

/// Greedy distance clustering: each unassigned point, in input order, seeds
/// a cluster with every later unassigned point within `radius_km`.
pub fn cluster_with_radius(points: &[SensorPoint], radius_km: f64, max_clusters: Option<usize>) -> Vec<Cluster> {
    let mut assigned = vec![false; points.len()];
    let mut clusters = Vec::new();

    for i in 0..points.len() {
        if assigned[i] {
            continue;
        }
        assigned[i] = true;
        let seed = &points[i];
        let mut members = vec![seed];

        for j in (i + 1)..points.len() {
            if assigned[j] {
                continue;
            }
            let other = &points[j];
            if haversine_km(seed.lat, seed.lon, other.lat, other.lon) <= radius_km {
                assigned[j] = true;
                members.push(other);
            }
        }
        clusters.push(aggregate(&members));
    }

    cap_clusters(clusters, max_clusters)
}

/// Grid clustering keyed by `(floor(lat*10^p), floor(lon*10^p))`.
///
/// When a cap is set and the cells outnumber it by more than
/// [`GRID_COARSEN_FACTOR`], the precision is lowered one step at a time
/// (down to 0) before the pairwise merge runs on what is left.
pub fn grid_cluster(points: &[SensorPoint], precision: u32, max_clusters: Option<usize>) -> Vec<Cluster> {
    let mut precision = precision.min(12);
    let mut cells = grid_cells(points, precision);

    if let Some(max) = max_clusters.map(|m| m.max(1)) {
        while precision > 0 && cells.len() > max.saturating_mul(GRID_COARSEN_FACTOR) {
            precision -= 1;
            cells = grid_cells(points, precision);
        }
    }

    let clusters = cells.values().map(|members| aggregate(members)).collect();
    cap_clusters(clusters, max_clusters)
}

fn grid_cells(points: &[SensorPoint], precision: u32) -> BTreeMap<(i64, i64), Vec<&SensorPoint>> {
    let scale = 10f64.powi(precision as i32);
    let mut cells: BTreeMap<(i64, i64), Vec<&SensorPoint>> = BTreeMap::new();
    for point in points {
        let key = ((point.lat * scale).floor() as i64, (point.lon * scale).floor() as i64);
        cells.entry(key).or_default().push(point);
    }
    cells
}

/// Picks the grid above `grid_threshold` points, distance clustering below.
pub fn cluster_snapshot(points: &[SensorPoint], zoom: f64, config: &ClusterConfig) -> (Vec<Cluster>, ClusterStrategy) {
    if points.len() > config.grid_threshold {
        (
            grid_cluster(points, config.precision, config.max_clusters),
            ClusterStrategy::Grid,
        )
    } else {
        let radius = config.base_radius_km / 2f64.powf(zoom);
        (
            cluster_with_radius(points, radius, config.max_clusters),
            ClusterStrategy::Distance,
        )
    }
}

fn aggregate(members: &[&SensorPoint]) -> Cluster {
    let n = members.len() as f64;
    Cluster {
        lat: members.iter().map(|p| p.lat).sum::<f64>() / n,
        lon: members.iter().map(|p| p.lon).sum::<f64>() / n,
        count: members.len(),
        avg_value: members.iter().map(|p| p.value).sum::<f64>() / n,
    }
}

/// Merges the closest pair until at most `max_clusters` remain. A cap of 0
/// is treated as 1.
///
/// Every live cluster caches its nearest neighbour, so a merge only rescans
/// the clusters whose cached neighbour was one of the merged pair.
fn cap_clusters(clusters: Vec<Cluster>, max_clusters: Option<usize>) -> Vec<Cluster> {
    let Some(max) = max_clusters.map(|m| m.max(1)) else {
        return clusters;
    };
    if clusters.len() <= max {
        return clusters;
    }

    let mut slots: Vec<Option<Cluster>> = clusters.into_iter().map(Some).collect();
    let mut nearest: Vec<(usize, f64)> = (0..slots.len()).map(|i| nearest_to(&slots, i)).collect();
    let mut live = slots.len();

    while live > max {
        let Some(i) = (0..slots.len())
            .filter(|&k| slots[k].is_some())
            .min_by(|&a, &b| nearest[a].1.total_cmp(&nearest[b].1))
        else {
            break;
        };
        let j = nearest[i].0;
        let (keep, gone) = (i.min(j), i.max(j));
        if keep == gone {
            break;
        }
        let (Some(a), Some(b)) = (slots[keep].take(), slots[gone].take()) else {
            break;
        };
        slots[keep] = Some(a.merge(&b));
        live -= 1;

        nearest[keep] = nearest_to(&slots, keep);
        for k in 0..slots.len() {
            if k == keep || slots[k].is_none() {
                continue;
            }
            if nearest[k].0 == keep || nearest[k].0 == gone {
                nearest[k] = nearest_to(&slots, k);
            } else if let (Some(c), Some(merged)) = (&slots[k], &slots[keep]) {
                let d = distance(c, merged);
                if d < nearest[k].1 {
                    nearest[k] = (keep, d);
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}

fn distance(a: &Cluster, b: &Cluster) -> f64 {
    haversine_km(a.lat, a.lon, b.lat, b.lon)
}

/// Closest other live cluster to slot `i`, first index on ties.
fn nearest_to(slots: &[Option<Cluster>], i: usize) -> (usize, f64) {
    let Some(me) = &slots[i] else {
        return (i, f64::INFINITY);
    };
    slots
        .iter()
        .enumerate()
        .filter(|(k, _)| *k != i)
        .filter_map(|(k, c)| c.as_ref().map(|c| (k, distance(me, c))))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((i, f64::INFINITY))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, lat: f64, lon: f64, value: f64) -> SensorPoint {
        SensorPoint {
            id: id.to_string(),
            lat,
            lon,
            value,
        }
    }

    /// Two points about 50 km apart along a meridian.
    fn pair() -> Vec<SensorPoint> {
        vec![point("a", 45.0, 7.0, 1.0), point("b", 45.45, 7.0, 3.0)]
    }

    fn scattered(n: usize) -> Vec<SensorPoint> {
        (0..n)
            .map(|i| {
                let f = i as f64;
                point(&i.to_string(), -60.0 + (f * 7.3) % 120.0, -170.0 + (f * 13.1) % 340.0, f % 11.0)
            })
            .collect()
    }

    #[test]
    fn haversine_matches_known_distance() {
        let d = haversine_km(45.0, 7.0, 45.45, 7.0);
        assert!((d - 50.04).abs() < 0.1, "got {}", d);
        assert_eq!(haversine_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn zoomed_out_pair_becomes_one_cluster() {
        let clusters = cluster_sensors(&pair(), 2.0, None);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 2);
        assert!((clusters[0].avg_value - 2.0).abs() < 1e-12);
        assert!((clusters[0].lat - 45.225).abs() < 1e-12);
    }

    #[test]
    fn zoomed_in_pair_stays_apart() {
        let clusters = cluster_sensors(&pair(), 10.0, None);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.count == 1));
    }

    #[test]
    fn counts_always_add_up() {
        let points = scattered(257);
        for zoom in [0.0, 2.0, 5.0, 9.0] {
            for cap in [None, Some(0), Some(1), Some(10)] {
                let total: usize = cluster_sensors(&points, zoom, cap).iter().map(|c| c.count).sum();
                assert_eq!(total, points.len());
            }
        }
        for precision in [0, 1, 3] {
            let total: usize = grid_cluster(&points, precision, Some(25)).iter().map(|c| c.count).sum();
            assert_eq!(total, points.len());
        }
    }

    #[test]
    fn cap_is_respected_and_zero_means_one() {
        let points = scattered(40);
        assert!(cluster_sensors(&points, 12.0, Some(7)).len() <= 7);
        assert_eq!(cluster_sensors(&points, 12.0, Some(0)).len(), 1);
        assert_eq!(grid_cluster(&points, 2, Some(0)).len(), 1);
    }

    #[test]
    fn merging_is_count_weighted() {
        let points = vec![
            point("a", 0.0, 0.0, 0.0),
            point("b", 0.0, 0.0001, 0.0),
            point("c", 0.0, 0.0002, 0.0),
            point("d", 10.0, 0.0, 8.0),
        ];
        // Radius 1 km: a, b and c cluster together, d stays alone.
        let clusters = cluster_with_radius(&points, 1.0, Some(1));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 4);
        assert!((clusters[0].lat - 2.5).abs() < 1e-9);
        assert!((clusters[0].avg_value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn grid_buckets_by_truncated_coordinates() {
        let points = vec![
            point("a", 10.11, 20.11, 1.0),
            point("b", 10.19, 20.14, 3.0),
            point("c", 10.21, 20.11, 5.0),
            point("d", -0.05, -0.05, 7.0),
        ];
        let clusters = grid_cluster(&points, 1, None);
        assert_eq!(clusters.len(), 3);

        let merged = clusters.iter().find(|c| c.count == 2).unwrap();
        assert!((merged.lat - 10.15).abs() < 1e-9);
        assert!((merged.avg_value - 2.0).abs() < 1e-9);
        // floor keeps small negatives out of the zero cell.
        assert!(clusters.iter().any(|c| c.lat < 0.0 && c.count == 1));
    }

    #[test]
    fn snapshot_switches_strategy_on_size() {
        let config = ClusterConfig {
            grid_threshold: 50,
            ..Default::default()
        };
        let (_, small) = cluster_snapshot(&scattered(50), 3.0, &config);
        let (clusters, large) = cluster_snapshot(&scattered(51), 3.0, &config);

        assert_eq!(small, ClusterStrategy::Distance);
        assert_eq!(large, ClusterStrategy::Grid);
        assert_eq!(clusters.iter().map(|c| c.count).sum::<usize>(), 51);
    }

    /// Merges the globally closest pair, rescanning every pair each time.
    fn cap_by_full_scan(mut clusters: Vec<Cluster>, max: usize) -> Vec<Cluster> {
        while clusters.len() > max {
            let mut best = (0, 1, f64::INFINITY);
            for i in 0..clusters.len() {
                for j in (i + 1)..clusters.len() {
                    let d = distance(&clusters[i], &clusters[j]);
                    if d < best.2 {
                        best = (i, j, d);
                    }
                }
            }
            let absorbed = clusters.remove(best.1);
            clusters[best.0] = clusters[best.0].merge(&absorbed);
        }
        clusters
    }

    #[test]
    fn cached_neighbours_merge_like_a_full_scan() {
        let singles = cluster_with_radius(&scattered(60), 0.001, None);
        assert_eq!(singles.len(), 60);

        for max in [1, 7, 30] {
            let fast = cap_clusters(singles.clone(), Some(max));
            let slow = cap_by_full_scan(singles.clone(), max);
            assert_eq!(fast.len(), slow.len());
            for (a, b) in fast.iter().zip(&slow) {
                assert_eq!(a.count, b.count);
                assert!((a.lat - b.lat).abs() < 1e-9 && (a.lon - b.lon).abs() < 1e-9);
                assert!((a.avg_value - b.avg_value).abs() < 1e-9);
            }
        }
    }

    /// One point per 0.1 degree cell.
    fn lattice(n: usize) -> Vec<SensorPoint> {
        (0..n)
            .map(|i| point(&i.to_string(), 40.05 + (i / 50) as f64 * 0.1, 5.05 + (i % 50) as f64 * 0.1, 1.0))
            .collect()
    }

    #[test]
    fn capping_thousands_of_cells_stays_fast() {
        let points = lattice(2000);
        let started = std::time::Instant::now();

        let grid = grid_cluster(&points, 1, Some(200));
        assert!(grid.len() <= 200);
        assert_eq!(grid.iter().map(|c| c.count).sum::<usize>(), 2000);

        let distance = cluster_with_radius(&points, 0.5, Some(200));
        assert_eq!(distance.len(), 200);
        assert_eq!(distance.iter().map(|c| c.count).sum::<usize>(), 2000);

        assert!(started.elapsed() < std::time::Duration::from_secs(30), "took {:?}", started.elapsed());
    }

    #[test]
    fn grid_coarsens_only_when_far_over_the_cap() {
        let points = lattice(400);
        // 400 cells against a cap of 100 is within the factor: precision is kept.
        let kept = grid_cluster(&points, 1, Some(100));
        assert_eq!(kept.len(), 100);

        // Against a cap of 10 the grid drops to whole degrees first.
        let coarse = grid_cluster(&points, 1, Some(10));
        assert!(coarse.len() <= 10);
        assert_eq!(coarse.iter().map(|c| c.count).sum::<usize>(), 400);
    }

    #[test]
    fn empty_input_gives_no_clusters() {
        assert!(cluster_sensors(&[], 3.0, Some(5)).is_empty());
        assert!(grid_cluster(&[], 2, None).is_empty());
    }
}
