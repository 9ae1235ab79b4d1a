//! Bridge configuration.
//!
//! [`BridgeConfig`] groups one section per component. [`ConfigLoader`]
//! assembles it from four layers, later ones winning:
//!
//! | Layer | Source |
//! |-------|--------|
//! | 1 | compile-time defaults |
//! | 2 | `~/.blim/config.toml` |
//! | 3 | `<project>/.blim/config.toml` |
//! | 4 | `BLIM_*` environment variables ([`ENV_VARS`]) |
//!
//! ```toml
//! [engine]
//! output_capacity = 100
//! watchdog_instructions = 1000
//! sleep_slice_ms = 5
//!
//! [collector]
//! buffer_size = 1024
//!
//! [device]
//! read_timeout_ms = 5000
//! write_timeout_ms = 5000
//!
//! [dispatch]
//! queue_capacity = 256
//!
//! [drain]
//! final_timeout_ms = 100
//! ```
//!
//! Environment overrides: `BLIM_OUTPUT_CAPACITY`, `BLIM_WATCHDOG_INSTRUCTIONS`,
//! `BLIM_COLLECTOR_BUFFER`, `BLIM_READ_TIMEOUT_MS`, `BLIM_WRITE_TIMEOUT_MS`,
//! `BLIM_DISPATCH_QUEUE`.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::{ConfigLoader, ENV_VARS};
pub use types::{
    BridgeConfig, CollectorConfig, DeviceConfig, DispatchConfig, DrainConfig, EngineConfig,
};

use std::path::PathBuf;

/// Directory holding per-user and per-project config files.
pub const PROJECT_CONFIG_DIR: &str = ".blim";

pub const PROJECT_CONFIG_FILE: &str = "config.toml";

/// `~/.blim`, or `./.blim` when there is no home directory.
#[must_use]
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PROJECT_CONFIG_DIR)
}

/// `~/.blim/config.toml`
#[must_use]
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(PROJECT_CONFIG_FILE)
}
