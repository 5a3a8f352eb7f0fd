//! Transport abstraction for the controller link.
//!
//! Provides the `Transport`/`DeviceHandle` traits, the `serialport` backend
//! and an in-memory mock for tests.

pub mod error;
pub mod mock;
pub mod sync_port;
pub mod traits;

pub use error::PortError;
pub use mock::{MockDeviceHandle, MockTransport};
pub use sync_port::*;
pub use traits::*;
