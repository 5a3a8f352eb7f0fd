//! Core traits for the transport abstraction.
//!
//! `Transport` covers discovery, hotplug, permission and opening; a
//! `DeviceHandle` is one open connection that supports a blocking,
//! timeout-bounded read and an out-of-band close. Both the `serialport`
//! backend and the in-memory mock implement them.

use super::error::PortError;
use crate::event::EventSender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of an attached device.
///
/// Only `vendor_id`, `product_id` and `name` take part in equality; the
/// descriptive strings are carried along for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Transport-assigned name (e.g. `/dev/ttyACM0` or `COM4`).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl DeviceIdentity {
    /// Create an identity with no descriptive strings.
    pub fn new(vendor_id: u16, product_id: u16, name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.into(),
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether this device carries the given vendor/product pair.
    pub fn matches(&self, target: TargetDevice) -> bool {
        self.vendor_id == target.vendor_id && self.product_id == target.product_id
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.name == other.name
    }
}

impl Eq for DeviceIdentity {}

impl std::hash::Hash for DeviceIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.vendor_id.hash(state);
        self.product_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}]",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// The vendor/product pair the watcher filters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl TargetDevice {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl Default for TargetDevice {
    /// The hardware-button controller shipped with the capture head.
    fn default() -> Self {
        Self::new(0x1209, 0xC550)
    }
}

/// Line settings applied when a device is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSettings {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Assert DTR after opening. The controller stays silent until it sees DTR.
    pub assert_dtr: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            assert_dtr: true,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Result of one blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// The timeout elapsed with nothing to read.
    Timeout,
}

/// Token returned by subscription calls, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One open device connection.
///
/// `read` is called from the session's read thread while `close` is called
/// from the orchestrator thread, so implementations must be `Sync` and must
/// let `close` make progress while a read is blocked.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Claim the device's data interface exclusively.
    fn claim_interface(&self) -> Result<(), PortError>;

    /// Block for at most `timeout` waiting for bytes.
    ///
    /// Returns [`PortError::Closed`] once [`close`](Self::close) has been called.
    fn read(&self, buffer: &mut [u8], timeout: Duration) -> Result<ReadOutcome, PortError>;

    /// Release the device. Idempotent.
    fn close(&self);

    /// Get the transport name of the device behind this handle.
    fn name(&self) -> &str;
}

/// Serial transport: discovery, hotplug, permission and open.
pub trait Transport: Send + Sync + fmt::Debug {
    /// List the devices currently attached.
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, PortError>;

    /// Start delivering unfiltered attach/detach events to `sink`.
    fn subscribe(&self, sink: EventSender) -> Result<SubscriptionId, PortError>;

    /// Stop delivering events to a subscription.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PortError>;

    /// Whether the process already holds access to `device`.
    fn has_permission(&self, device: &DeviceIdentity) -> bool;

    /// Register a sink for permission results.
    ///
    /// Results of requests issued while no listener is registered are lost.
    fn register_permission_listener(&self, sink: EventSender)
        -> Result<SubscriptionId, PortError>;

    /// Remove a permission listener.
    fn unregister_permission_listener(&self, id: SubscriptionId) -> Result<(), PortError>;

    /// Ask for access to `device`. The answer arrives later as a
    /// `ChannelEvent::PermissionResult` on every registered listener.
    fn request_permission(&self, device: &DeviceIdentity) -> Result<(), PortError>;

    /// Open `device` with the given line settings.
    fn open(
        &self,
        device: &DeviceIdentity,
        settings: &LineSettings,
    ) -> Result<Box<dyn DeviceHandle>, PortError>;
}
