//! Serial Command Channel Library
//!
//! Listens to a USB serial hardware controller and turns its newline-framed
//! text commands (`CAPTURE`, `UV`, `RGB`) into calls on a camera-side
//! [`CommandReceiver`].
//!
//! # Modules
//!
//! - `port`: Transport abstraction, the `serialport` backend and a mock
//! - `watcher`: Attach/detach filtering for the target controller
//! - `permission`: Access negotiation before opening
//! - `session`: One open device plus its read thread
//! - `frame`: Newline reassembly of the byte stream
//! - `command`: Line parsing into typed commands
//! - `dispatch`: Rate-limited routing to the receiver
//! - `orchestrator`: Lifecycle and the event loop
//! - `state`: Channel lifecycle state
//! - `config`: Configuration management with TOML support
//! - `error`: Channel-level errors
//!
//! # Example
//!
//! ```no_run
//! use serial_command_channel::{
//!     ChannelOrchestrator, CommandReceiver, NullObserver, OrchestratorConfig, SerialportTransport,
//! };
//! use std::sync::Arc;
//!
//! struct Camera;
//!
//! impl CommandReceiver for Camera {
//!     fn trigger_capture(&mut self) -> bool { true }
//!     fn switch_to_normal_mode(&mut self) -> bool { true }
//!     fn switch_to_fluorescence_mode(&mut self) -> bool { true }
//!     fn is_guided_session_active(&self) -> bool { false }
//! }
//!
//! let mut channel = ChannelOrchestrator::new(
//!     Arc::new(SerialportTransport::default()),
//!     Box::new(Camera),
//!     Box::new(NullObserver),
//!     OrchestratorConfig::default(),
//! );
//! channel.start()?;
//! channel.run_until_shutdown();
//! channel.destroy();
//! # Ok::<(), serial_command_channel::ChannelError>(())
//! ```

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;
pub mod orchestrator;
pub mod permission;
pub mod port;
pub mod session;
pub mod state;
pub mod watcher;

// Re-export commonly used types for convenience
pub use command::{Command, CommandKind};
pub use dispatch::{CommandDispatcher, CommandReceiver, DispatchOutcome};
pub use error::{ChannelError, ChannelResult};
pub use event::{ChannelEvent, EventSender};
pub use orchestrator::{ChannelObserver, ChannelOrchestrator, NullObserver, OrchestratorConfig};
pub use port::{
    DeviceIdentity, LineSettings, MockTransport, PortError, SerialportTransport, TargetDevice,
    Transport,
};
pub use session::{SessionConfig, SessionStatus};
pub use state::ChannelState;

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
