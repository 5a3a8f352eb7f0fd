//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::port::{DataBits, FlowControl, LineSettings, Parity, StopBits, TargetDevice};
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which controller to watch for
    pub device: DeviceConfig,
    /// Serial line and read-loop settings
    pub serial: SerialConfig,
    /// Command dispatch settings
    pub dispatch: DispatchConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values the channel cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let serial = &self.serial;
        if serial.baud_rate == 0 {
            return Err(ConfigError::validation("serial", "baud_rate", "must be greater than 0"));
        }
        if serial.read_buffer_size == 0 {
            return Err(ConfigError::validation(
                "serial",
                "read_buffer_size",
                "must be greater than 0",
            ));
        }
        for (key, value) in [
            ("read_timeout_ms", serial.read_timeout_ms),
            ("join_timeout_ms", serial.join_timeout_ms),
            ("hotplug_poll_ms", serial.hotplug_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::validation("serial", key, "must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// Target device section.
///
/// TOML accepts hex integers, so `vendor_id = 0x1209` works as written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// USB vendor ID of the controller
    pub vendor_id: u16,
    /// USB product ID of the controller
    pub product_id: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let target = TargetDevice::default();
        Self {
            vendor_id: target.vendor_id,
            product_id: target.product_id,
        }
    }
}

impl DeviceConfig {
    pub fn target(&self) -> TargetDevice {
        TargetDevice::new(self.vendor_id, self.product_id)
    }
}

/// Serial port configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Assert DTR after opening
    pub assert_dtr: bool,
    /// Upper bound for one blocking read, in milliseconds
    pub read_timeout_ms: u64,
    /// Read buffer size in bytes
    pub read_buffer_size: usize,
    /// How long stopping waits for the read thread, in milliseconds
    pub join_timeout_ms: u64,
    /// Interval between hotplug scans, in milliseconds
    pub hotplug_poll_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let line = LineSettings::default();
        let session = SessionConfig::default();
        Self {
            baud_rate: line.baud_rate,
            data_bits: line.data_bits,
            parity: line.parity,
            stop_bits: line.stop_bits,
            flow_control: line.flow_control,
            assert_dtr: line.assert_dtr,
            read_timeout_ms: session.read_timeout.as_millis() as u64,
            read_buffer_size: session.read_buffer_size,
            join_timeout_ms: session.join_timeout.as_millis() as u64,
            hotplug_poll_ms: 500,
        }
    }
}

impl SerialConfig {
    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            flow_control: self.flow_control,
            parity: self.parity,
            stop_bits: self.stop_bits,
            assert_dtr: self.assert_dtr,
        }
    }

    /// Build the per-session settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            line_settings: self.line_settings(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            read_buffer_size: self.read_buffer_size,
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }

    /// Get the hotplug poll interval as Duration
    pub fn hotplug_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms)
    }
}

/// Dispatch configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Minimum spacing between executed commands, in milliseconds
    pub min_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: crate::dispatch::DEFAULT_MIN_INTERVAL.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}
