//! Configuration for the command channel host.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//! The library itself never reads it; the binary loads it and hands the
//! pieces to the orchestrator.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `CMD_CHANNEL_CONFIG` environment variable (explicit path)
//! 2. `./command-channel.toml` (current directory)
//! 3. The platform config directory (`~/.config/serial-command-channel/` on Linux)
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is: `CMD_CHANNEL_<SECTION>_<KEY>`
//!
//! Examples:
//! - `CMD_CHANNEL_DEVICE_VENDOR_ID=1209`
//! - `CMD_CHANNEL_SERIAL_READ_TIMEOUT_MS=500`
//! - `CMD_CHANNEL_LOGGING_FORMAT=json`
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_command_channel::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let config = loader.config();
//!
//! println!("Controller: {:04x}:{:04x}", config.device.vendor_id, config.device.product_id);
//! # Ok::<(), serial_command_channel::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, parse_usb_id, resolve_config_path,
    ConfigLoader,
};
pub use schema::{
    Config, DeviceConfig, DispatchConfig, LogFormat, LoggingConfig, SerialConfig,
};
