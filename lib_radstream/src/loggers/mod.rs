//! # Logging Setup
//!
//! Console plus file logging for the `log` facade, built on `fern`.
//!
//! ## Contained Modules:
//! - **`setup`**: `setup_logging`, level parsing and pruning of old log files.

/// Installs the global `fern` dispatcher.
pub mod setup;

pub use setup::{build_dispatch, cleanup_old_logs, parse_level, setup_logging};
