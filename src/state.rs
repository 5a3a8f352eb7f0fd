use crate::port::DeviceIdentity;
use serde::Serialize;
use std::fmt;

/// Lifecycle state of the command channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "status", content = "details")]
pub enum ChannelState {
    /// Not watching; `start` has not been called or `stop` was called.
    #[default]
    Stopped,
    /// Watching for the controller to attach.
    Watching,
    /// The controller is attached and a permission answer is outstanding.
    PermissionPending { device: DeviceIdentity },
    /// A session is open and its read thread is running.
    Reading { device: DeviceIdentity },
    /// Torn down for good.
    Destroyed,
}

impl ChannelState {
    /// The device this state is bound to, if any.
    pub fn device(&self) -> Option<&DeviceIdentity> {
        match self {
            Self::PermissionPending { device } | Self::Reading { device } => Some(device),
            _ => None,
        }
    }

    /// Watching, waiting for permission, or reading.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Watching | Self::PermissionPending { .. } | Self::Reading { .. }
        )
    }

    pub fn is_reading(&self) -> bool {
        matches!(self, Self::Reading { .. })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Watching => "watching",
            Self::PermissionPending { .. } => "permission_pending",
            Self::Reading { .. } => "reading",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device() {
            Some(device) => write!(f, "{} ({})", self.name(), device),
            None => f.write_str(self.name()),
        }
    }
}
