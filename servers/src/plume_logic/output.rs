use anyhow::{Context, Result};
use lib_radstream::ingestors::{ClusterSnapshot, ZoneSnapshot};
use lib_radstream::transport::ConnectionState;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const ZONES_FILE: &str = "zones.json";
pub const CLUSTERS_FILE: &str = "clusters.json";

/// Writes `value` as pretty JSON next to `path`, then renames it into place
/// so readers never see a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Logs every published snapshot and state change, and mirrors the latest
/// snapshots into `output_dir` when one is configured.
pub async fn run(
    output_dir: Option<PathBuf>,
    mut zones: watch::Receiver<ZoneSnapshot>,
    mut clusters: Option<watch::Receiver<Option<ClusterSnapshot>>>,
    mut state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    if let Some(dir) = &output_dir {
        if let Err(e) = fs::create_dir_all(dir) {
            log::error!("Cannot create output dir {}: {}", dir.display(), e);
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                log::info!("Stream connection is {}.", current);
            }
            changed = zones.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = zones.borrow_and_update().clone();
                log::info!(
                    "Zones for {}: {} zone(s) from {} particles.",
                    snapshot.simulation_id.as_deref().unwrap_or("<none>"),
                    snapshot.zones.len(),
                    snapshot.particle_count
                );
                persist(output_dir.as_deref(), ZONES_FILE, &snapshot);
            }
            snapshot = next_clusters(&mut clusters) => match snapshot {
                Some(Some(snapshot)) => {
                    log::info!(
                        "Sensors: {} point(s) in {} cluster(s).",
                        snapshot.point_count,
                        snapshot.clusters.len()
                    );
                    persist(output_dir.as_deref(), CLUSTERS_FILE, &snapshot);
                }
                Some(None) => {}
                None => clusters = None,
            },
        }
    }

    log::info!("Snapshot writer stopped.");
}

fn persist<T: Serialize>(dir: Option<&Path>, name: &str, value: &T) {
    let Some(dir) = dir else {
        return;
    };
    if let Err(e) = write_json_atomic(&dir.join(name), value) {
        log::error!("{:#}", e);
    }
}

/// Next cluster snapshot; `None` once the poller is gone.
async fn next_clusters(
    rx: &mut Option<watch::Receiver<Option<ClusterSnapshot>>>,
) -> Option<Option<ClusterSnapshot>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ZONES_FILE);
        write_json_atomic(&path, &ZoneSnapshot::empty(Some("sim".to_string()))).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"simulationId\": \"sim\""));
        assert!(!dir.path().join("zones.json.tmp").exists());
    }

    #[tokio::test]
    async fn mirrors_zone_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let (zones_tx, zones_rx) = watch::channel(ZoneSnapshot::empty(None));
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Some(dir.path().to_path_buf()), zones_rx, None, state_rx, cancel.clone()));

        zones_tx.send_replace(ZoneSnapshot::empty(Some("sim-3".to_string())));
        let path = dir.path().join(ZONES_FILE);
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let written: ZoneSnapshot = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.simulation_id.as_deref(), Some("sim-3"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
