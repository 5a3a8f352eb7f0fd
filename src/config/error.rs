//! Errors raised while loading, validating or saving the channel config.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named config file does not exist
    #[error("Command channel config not found: {0}")]
    NotFound(PathBuf),

    /// The config file exists but could not be read
    #[error("Failed to read command channel config '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the schema
    #[error("Invalid command channel config '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize command channel config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Failed to write command channel config '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value parsed but the channel cannot run with it
    #[error("Invalid value for `{key}` in [{section}]: {message}")]
    ValidationError {
        section: String,
        key: String,
        message: String,
    },

    /// A `CMD_CHANNEL_*` override could not be parsed
    #[error("Invalid override in environment variable '{var}': {message}")]
    EnvParseError { var: String, message: String },
}

impl ConfigError {
    /// Create a validation error for `key` in the `[section]` table.
    pub fn validation<S, K, M>(section: S, key: K, message: M) -> Self
    where
        S: Into<String>,
        K: Into<String>,
        M: Into<String>,
    {
        Self::ValidationError {
            section: section.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an env parse error
    pub fn env_parse<V: Into<String>, M: Into<String>>(var: V, message: M) -> Self {
        Self::EnvParseError {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_table_and_key() {
        let err = ConfigError::validation("serial", "read_buffer_size", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for `read_buffer_size` in [serial]: must be greater than 0"
        );
    }

    #[test]
    fn test_env_message_names_variable() {
        let err = ConfigError::env_parse("CMD_CHANNEL_SERIAL_BAUD_RATE", "Invalid baud rate");
        assert_eq!(
            err.to_string(),
            "Invalid override in environment variable 'CMD_CHANNEL_SERIAL_BAUD_RATE': Invalid baud rate"
        );
    }
}
