//! `serialport`-backed transport.
//!
//! Hotplug is emulated by polling `serialport::available_ports()` on a
//! background thread and diffing successive snapshots. Permission maps to
//! the filesystem access check on the device node.

use super::error::PortError;
use super::traits::{
    DeviceHandle, DeviceIdentity, LineSettings, ReadOutcome, SubscriptionId, Transport,
};
use crate::event::{ChannelEvent, EventSender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Default interval between hotplug scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Longest single blocking read on the port. `close` can only release the
/// port between slices.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Source of port snapshots for the hotplug monitor.
type Enumerator = Box<dyn Fn() -> Result<Vec<DeviceIdentity>, PortError> + Send + Sync>;

struct Shared {
    subscribers: Mutex<Vec<(SubscriptionId, EventSender)>>,
    permission_listeners: Mutex<Vec<(SubscriptionId, EventSender)>>,
    next_id: AtomicU64,
    /// Set while the hotplug thread is alive. Only changed under the
    /// `subscribers` lock.
    monitor_running: AtomicBool,
    poll_interval: Duration,
    enumerate: Enumerator,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("subscribers", &self.subscribers.try_lock().map(|s| s.len()))
            .field("monitor_running", &self.monitor_running)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Shared {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn snapshot(&self) -> Option<HashSet<DeviceIdentity>> {
        match (self.enumerate)() {
            Ok(ports) => Some(ports.into_iter().collect()),
            Err(e) => {
                warn!("Port enumeration failed: {}", e);
                None
            }
        }
    }
}

/// Transport over the host's USB serial ports.
#[derive(Debug, Clone)]
pub struct SerialportTransport {
    shared: Arc<Shared>,
}

impl SerialportTransport {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_enumerator(poll_interval, Box::new(list_usb_ports))
    }

    fn with_enumerator(poll_interval: Duration, enumerate: Enumerator) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Vec::new()),
                permission_listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                monitor_running: AtomicBool::new(false),
                poll_interval,
                enumerate,
            }),
        }
    }

    /// Start the hotplug thread, diffing against `baseline`.
    fn spawn_monitor(&self, baseline: HashSet<DeviceIdentity>) -> Result<(), PortError> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("serial-hotplug".to_string())
            .spawn(move || run_monitor(shared, baseline))?;
        Ok(())
    }
}

impl Default for SerialportTransport {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

/// Enumerate USB serial ports.
///
/// Ports without USB descriptors (built-in UARTs, Bluetooth, PCI) have no
/// vendor/product pair and are skipped.
pub fn list_usb_ports() -> Result<Vec<DeviceIdentity>, PortError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(info) => Some(DeviceIdentity {
                vendor_id: info.vid,
                product_id: info.pid,
                name: port.port_name,
                serial_number: info.serial_number,
                manufacturer: info.manufacturer,
                product: info.product,
            }),
            _ => {
                trace!(port = %port.port_name, "Skipping non-USB port");
                None
            }
        })
        .collect())
}

fn run_monitor(shared: Arc<Shared>, mut known: HashSet<DeviceIdentity>) {
    debug!(
        interval_ms = shared.poll_interval.as_millis() as u64,
        known = known.len(),
        "Hotplug monitor started"
    );

    loop {
        thread::sleep(shared.poll_interval);

        {
            let subscribers = shared.subscribers.lock();
            if subscribers.is_empty() {
                shared.monitor_running.store(false, Ordering::Release);
                debug!("Hotplug monitor stopped");
                return;
            }
        }

        let Some(current) = shared.snapshot() else {
            continue;
        };
        let mut events: Vec<ChannelEvent> = known
            .difference(&current)
            .cloned()
            .map(ChannelEvent::DeviceDetached)
            .collect();
        events.extend(
            current
                .difference(&known)
                .cloned()
                .map(ChannelEvent::DeviceAttached),
        );
        known = current;

        let mut subscribers = shared.subscribers.lock();
        for event in events {
            trace!(?event, "Hotplug change");
            subscribers.retain(|(_, sink)| sink.send(event.clone()).is_ok());
        }
    }
}

#[cfg(unix)]
fn check_access(device: &DeviceIdentity) -> bool {
    let Ok(path) = std::ffi::CString::new(device.name.as_str()) else {
        return false;
    };
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn check_access(_device: &DeviceIdentity) -> bool {
    true
}

impl Transport for SerialportTransport {
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, PortError> {
        list_usb_ports()
    }

    /// The first subscriber starts the hotplug thread. Its baseline is
    /// taken before this returns, so a device that appears after the
    /// caller's own scan is still reported as attached.
    fn subscribe(&self, sink: EventSender) -> Result<SubscriptionId, PortError> {
        let id = self.shared.next_id();
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.push((id, sink));
        if !self.shared.monitor_running.swap(true, Ordering::AcqRel) {
            let baseline = self.shared.snapshot().unwrap_or_default();
            if let Err(e) = self.spawn_monitor(baseline) {
                self.shared.monitor_running.store(false, Ordering::Release);
                subscribers.retain(|(sid, _)| *sid != id);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PortError> {
        self.shared.subscribers.lock().retain(|(sid, _)| *sid != id);
        Ok(())
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        check_access(device)
    }

    fn register_permission_listener(
        &self,
        sink: EventSender,
    ) -> Result<SubscriptionId, PortError> {
        let id = self.shared.next_id();
        self.shared.permission_listeners.lock().push((id, sink));
        Ok(id)
    }

    fn unregister_permission_listener(&self, id: SubscriptionId) -> Result<(), PortError> {
        self.shared
            .permission_listeners
            .lock()
            .retain(|(sid, _)| *sid != id);
        Ok(())
    }

    /// There is no interactive grant on desktop hosts: the device node is
    /// re-checked once on a helper thread and the result posted to listeners.
    fn request_permission(&self, device: &DeviceIdentity) -> Result<(), PortError> {
        let shared = Arc::clone(&self.shared);
        let device = device.clone();
        thread::Builder::new()
            .name("serial-permission".to_string())
            .spawn(move || {
                let granted = check_access(&device);
                if !granted {
                    info!(
                        device = %device,
                        "No read/write access to device node; check group membership or udev rules"
                    );
                }
                let listeners = shared.permission_listeners.lock();
                for (_, sink) in listeners.iter() {
                    let _ = sink.send(ChannelEvent::PermissionResult {
                        device: device.clone(),
                        granted,
                    });
                }
            })?;
        Ok(())
    }

    fn open(
        &self,
        device: &DeviceIdentity,
        settings: &LineSettings,
    ) -> Result<Box<dyn DeviceHandle>, PortError> {
        Ok(Box::new(SerialportHandle::open(&device.name, settings)?))
    }
}

/// An open serial port.
///
/// The port lives behind a mutex that the read thread holds for at most one
/// [`READ_SLICE`]. `close` raises a flag and drops the port if it can take
/// the lock; otherwise the reader drops it as soon as its slice returns.
pub struct SerialportHandle {
    name: String,
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl SerialportHandle {
    /// Open `port_name` with the given line settings.
    ///
    /// # Example
    /// ```no_run
    /// use serial_command_channel::port::{LineSettings, SerialportHandle};
    ///
    /// let handle = SerialportHandle::open("/dev/ttyACM0", &LineSettings::default())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(port_name: &str, settings: &LineSettings) -> Result<Self, PortError> {
        let initial_timeout = Duration::from_millis(100);
        let mut port = serialport::new(port_name, settings.baud_rate)
            .data_bits(settings.data_bits.into())
            .flow_control(settings.flow_control.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .timeout(initial_timeout)
            .open()
            .map_err(|e| map_open_error(port_name, e))?;

        if settings.assert_dtr {
            port.write_data_terminal_ready(true)?;
        }

        debug!(port = port_name, baud = settings.baud_rate, "Serial port opened");
        Ok(Self {
            name: port_name.to_string(),
            port: Mutex::new(Some(port)),
            timeout: Mutex::new(initial_timeout),
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn map_open_error(port_name: &str, e: serialport::Error) -> PortError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => PortError::not_found(port_name),
        serialport::ErrorKind::InvalidInput => PortError::config(e.to_string()),
        serialport::ErrorKind::Io(ErrorKind::NotFound) => PortError::not_found(port_name),
        serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => {
            PortError::permission_denied(port_name)
        }
        _ => PortError::Serial(e),
    }
}

impl DeviceHandle for SerialportHandle {
    /// Serial ports are opened exclusively, so claiming amounts to checking
    /// the port is still there and discarding stale input.
    fn claim_interface(&self) -> Result<(), PortError> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let guard = self.port.lock();
        let port = guard.as_ref().ok_or(PortError::Closed)?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|_| PortError::no_interface(&self.name))
    }

    fn read(&self, buffer: &mut [u8], timeout: Duration) -> Result<ReadOutcome, PortError> {
        read_in_slices(timeout, READ_SLICE, || self.is_closed(), |slice| {
            let mut guard = self.port.lock();
            let port = guard.as_mut().ok_or(PortError::Closed)?;

            {
                let mut current = self.timeout.lock();
                if *current != slice {
                    port.set_timeout(slice)?;
                    *current = slice;
                }
            }

            let result = port.read(buffer);
            if self.is_closed() {
                guard.take();
                return Err(PortError::Closed);
            }

            match result {
                Ok(n) => Ok(Some(n)),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    Ok(None)
                }
                Err(e) => Err(PortError::Io(e)),
            }
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut guard) = self.port.try_lock() {
            guard.take();
        }
        debug!(port = %self.name, "Serial port closed");
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Repeat `read_once` with blocking slices of at most `slice` until it
/// yields data, fails, the handle closes, or `timeout` has passed.
/// `read_once` returns `Ok(None)` when its slice timed out.
fn read_in_slices(
    timeout: Duration,
    slice: Duration,
    is_closed: impl Fn() -> bool,
    mut read_once: impl FnMut(Duration) -> Result<Option<usize>, PortError>,
) -> Result<ReadOutcome, PortError> {
    let deadline = Instant::now() + timeout;
    loop {
        if is_closed() {
            return Err(PortError::Closed);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(n) = read_once(remaining.min(slice))? {
            return Ok(ReadOutcome::Data(n));
        }
        if Instant::now() >= deadline {
            return Ok(ReadOutcome::Timeout);
        }
    }
}

impl std::fmt::Debug for SerialportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialportHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
