use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Builds the dispatcher writing to `log_path` and, when `to_stdout` is set,
/// to standard output as well.
pub fn build_dispatch(log_path: &Path, level: log::LevelFilter, to_stdout: bool) -> Result<fern::Dispatch> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        // Socket and TLS internals are noisy below warn.
        .level_for("tungstenite", log::LevelFilter::Warn)
        .level_for("tokio_tungstenite", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn);

    if to_stdout {
        dispatch = dispatch.chain(std::io::stdout());
    }

    let file = fern::log_file(log_path).with_context(|| format!("Cannot open log file {}", log_path.display()))?;
    Ok(dispatch.chain(file))
}

/// Installs console + file logging for `app_name` under `log_dir`.
///
/// Creates the directory if needed, prunes all but the newest existing
/// `.log` file, and returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, app_name: &str, log_level: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir).with_context(|| format!("Cannot create log dir {}", log_dir.display()))?;
    }

    cleanup_old_logs(log_dir, 1)?;

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    build_dispatch(&log_path, parse_level(log_level), true)?
        .apply()
        .context("A global logger is already installed")?;

    log::info!("Logging to {}", log_path.display());
    Ok(log_path)
}

/// Deletes `.log` files in `log_dir`, keeping the `keep` most recently
/// modified ones. Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;
    use std::time::Duration;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Error);
        assert_eq!(parse_level("chatty"), log::LevelFilter::Info);
    }

    #[test]
    fn keeps_only_the_newest_logs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.log", "b.log", "c.log"] {
            fs::write(dir.path().join(name), name).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let removed = cleanup_old_logs(dir.path(), 1).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("c.log").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("a.log").exists());
    }

    #[test]
    fn dispatch_writes_formatted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plume.log");
        let (_, logger) = build_dispatch(&path, log::LevelFilter::Info, false).unwrap().into_log();

        logger.log(
            &log::Record::builder()
                .args(format_args!("zones derived"))
                .level(log::Level::Warn)
                .target("lib_radstream::geo")
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .args(format_args!("hidden"))
                .level(log::Level::Debug)
                .target("lib_radstream::geo")
                .build(),
        );
        logger.flush();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[lib_radstream::geo][WARN] zones derived"));
        assert!(!text.contains("hidden"));
    }
}
