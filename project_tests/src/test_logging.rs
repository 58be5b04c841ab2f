//! # Logging Setup Test
//!
//! `setup_logging` installs the process-wide logger, so this binary holds a
//! single test that covers directory creation, pruning of older log files
//! and that records actually reach the file.

#![forbid(unsafe_code)]

use std::fs;

use lib_radstream::loggers::setup_logging;

#[test]
fn setup_creates_prunes_and_writes() {
    let root = tempfile::tempdir().unwrap();
    let log_dir = root.path().join("logs");
    fs::create_dir_all(&log_dir).unwrap();
    fs::write(log_dir.join("server_plume_old1.log"), "old").unwrap();
    fs::write(log_dir.join("server_plume_old2.log"), "older").unwrap();
    fs::write(log_dir.join("notes.txt"), "keep me").unwrap();

    let path = setup_logging(&log_dir, "server_plume", "debug").unwrap();
    assert!(path.starts_with(&log_dir));

    log::warn!(target: "plume", "zone update pending");
    log::trace!("filtered out at debug level");
    log::logger().flush();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("zone update pending"));
    assert!(text.contains("[WARN]"));
    assert!(!text.contains("filtered out"));

    // One older log survives, plus the new one and the unrelated file.
    let logs = fs::read_dir(&log_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "log"))
        .count();
    assert_eq!(logs, 2);
    assert!(log_dir.join("notes.txt").exists());

    assert!(setup_logging(&log_dir, "server_plume", "info").is_err());
}
