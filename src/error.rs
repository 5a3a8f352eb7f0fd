use crate::port::PortError;
use thiserror::Error;

/// Errors surfaced by the channel's lifecycle operations.
///
/// Collaborator failures inside the running channel are logged and turned
/// into outcomes rather than returned; only the calls a host makes directly
/// (`start`, `request_access`, ...) produce these.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A transport call failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Access was requested before the permission listener was registered.
    #[error("Permission listener is not registered; register before requesting access")]
    NotRegistered,

    /// The orchestrator was destroyed and cannot be restarted.
    #[error("Channel has been destroyed")]
    Destroyed,
}

/// A specialized `Result` type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
