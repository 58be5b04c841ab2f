//! # Configuration Modules
//!
//! Layered JSON configuration for the streaming core.
//!
//! ## Contained Modules:
//! - **`config_core`**: `CoreConfig`, its defaults and validation, and the
//!   `config.global.json` -> `<name>.json` -> `<name>.<mode>.json` loader.

/// Core configuration document and loader.
pub mod config_core;

pub use config_core::{merge_json, ConfigError, CoreConfig};
