//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use super::ConfigError;
use crate::output::MAX_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
///
/// This is the unified configuration after merging all layers.
///
/// # Example
///
/// ```
/// use blim_runtime::config::BridgeConfig;
///
/// let config = BridgeConfig::default();
/// assert_eq!(config.engine.output_capacity, 100);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub engine: EngineConfig,
    pub collector: CollectorConfig,
    pub device: DeviceConfig,
    pub dispatch: DispatchConfig,
    pub drain: DrainConfig,
}

impl BridgeConfig {
    /// Serializes to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only if they
    /// differ from the default.
    pub fn merge(&mut self, other: &Self) {
        self.engine.merge(&other.engine);
        self.collector.merge(&other.collector);
        self.device.merge(&other.device);
        self.dispatch.merge(&other.dispatch);
        self.drain.merge(&other.drain);
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.output_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "engine.output_capacity",
                "must be greater than 0",
            ));
        }
        if self.engine.watchdog_instructions == 0 {
            return Err(ConfigError::invalid_value(
                "engine.watchdog_instructions",
                "must be greater than 0",
            ));
        }
        if self.collector.buffer_size == 0 || self.collector.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::invalid_value(
                "collector.buffer_size",
                format!("must be within 1..={MAX_BUFFER_SIZE}"),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "dispatch.queue_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Script engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the engine's output pipe.
    pub output_capacity: usize,

    /// Instructions between cancellation checks of a running script.
    pub watchdog_instructions: u32,

    /// Granularity of cancellable sleeps in milliseconds.
    pub sleep_slice_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_capacity: 100,
            watchdog_instructions: 1000,
            sleep_slice_ms: 5,
        }
    }
}

impl EngineConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.output_capacity != default.output_capacity {
            self.output_capacity = other.output_capacity;
        }
        if other.watchdog_instructions != default.watchdog_instructions {
            self.watchdog_instructions = other.watchdog_instructions;
        }
        if other.sleep_slice_ms != default.sleep_slice_ms {
            self.sleep_slice_ms = other.sleep_slice_ms;
        }
    }

    #[must_use]
    pub fn sleep_slice(&self) -> Duration {
        Duration::from_millis(self.sleep_slice_ms.max(1))
    }
}

/// Output collector settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    pub buffer_size: usize,
    pub start_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            start_timeout_ms: 1000,
            stop_timeout_ms: 5000,
        }
    }
}

impl CollectorConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.buffer_size != default.buffer_size {
            self.buffer_size = other.buffer_size;
        }
        if other.start_timeout_ms != default.start_timeout_ms {
            self.start_timeout_ms = other.start_timeout_ms;
        }
        if other.stop_timeout_ms != default.stop_timeout_ms {
            self.stop_timeout_ms = other.stop_timeout_ms;
        }
    }

    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Characteristic I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl DeviceConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.read_timeout_ms != default.read_timeout_ms {
            self.read_timeout_ms = other.read_timeout_ms;
        }
        if other.write_timeout_ms != default.write_timeout_ms {
            self.write_timeout_ms = other.write_timeout_ms;
        }
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Subscription dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Notifications buffered per subscription before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl DispatchConfig {
    fn merge(&mut self, other: &Self) {
        if other.queue_capacity != Self::default().queue_capacity {
            self.queue_capacity = other.queue_capacity;
        }
    }
}

/// Output drainer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrainConfig {
    pub final_timeout_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            final_timeout_ms: 100,
        }
    }
}

impl DrainConfig {
    fn merge(&mut self, other: &Self) {
        if other.final_timeout_ms != Self::default().final_timeout_ms {
            self.final_timeout_ms = other.final_timeout_ms;
        }
    }

    #[must_use]
    pub fn final_timeout(&self) -> Duration {
        Duration::from_millis(self.final_timeout_ms)
    }
}
