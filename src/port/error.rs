//! Port-specific error types.
//!
//! Transport and device-handle failures live here, separate from the
//! channel-level errors in `crate::error`.

use thiserror::Error;

/// Errors that can occur while talking to the serial transport.
#[derive(Debug, Error)]
pub enum PortError {
    /// The requested device is not (or no longer) attached.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// An I/O error occurred during a transport operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line settings or transport configuration were rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Attempted to open a session that is already open.
    #[error("Session is already open")]
    AlreadyOpen,

    /// Attempted to use a session that is not open.
    #[error("Session is not open")]
    NotOpen,

    /// The device handle was closed; no further reads are possible.
    #[error("Device handle is closed")]
    Closed,

    /// The device exposes no interface that could be claimed exclusively.
    #[error("No claimable interface on {0}")]
    NoClaimableInterface(String),

    /// The process holds no access grant for the device.
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    /// A serialport-specific error occurred.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl PortError {
    /// Create a NotFound error from a device name.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout(duration)
    }

    /// Create a NoClaimableInterface error from a device name.
    pub fn no_interface(name: impl Into<String>) -> Self {
        Self::NoClaimableInterface(name.into())
    }

    /// Create a PermissionDenied error from a device name.
    pub fn permission_denied(name: impl Into<String>) -> Self {
        Self::PermissionDenied(name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortError::not_found("/dev/ttyACM0");
        assert_eq!(err.to_string(), "Device not found: /dev/ttyACM0");

        let err = PortError::no_interface("/dev/ttyACM0");
        assert_eq!(err.to_string(), "No claimable interface on /dev/ttyACM0");

        let err = PortError::AlreadyOpen;
        assert_eq!(err.to_string(), "Session is already open");
    }

    #[test]
    fn test_timeout_error() {
        let duration = std::time::Duration::from_millis(500);
        let err = PortError::timeout(duration);
        assert!(err.to_string().contains("500ms"));
    }
}
