//! Mock transport implementation for testing.
//!
//! Provides a `MockTransport` that simulates attach/detach, permission grants
//! and device opening without hardware, and a `MockDeviceHandle` whose reads
//! are fed from a scripted queue of chunks.

use super::error::PortError;
use super::traits::{
    DeviceHandle, DeviceIdentity, LineSettings, ReadOutcome, SubscriptionId, Transport,
};
use crate::event::{ChannelEvent, EventSender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scripted state behind a mock handle.
#[derive(Debug, Default)]
struct MockHandleState {
    /// Chunks returned by successive reads, one chunk per read.
    read_queue: VecDeque<Vec<u8>>,
    /// Errors returned before any queued data.
    error_queue: VecDeque<std::io::ErrorKind>,
    /// Whether `claim_interface` succeeds.
    unclaimable: bool,
    claimed: bool,
    closed: bool,
    /// Reads sleep this long and ignore `close` while sleeping.
    stall: Option<Duration>,
    reads: u64,
}

/// Mock device handle.
///
/// Clones share state, so a test can keep one clone to feed data while the
/// session owns another.
///
/// # Example
/// ```
/// use serial_command_channel::port::{DeviceHandle, MockDeviceHandle, ReadOutcome};
/// use std::time::Duration;
///
/// let handle = MockDeviceHandle::new("MOCK0");
/// handle.enqueue_read(b"CAPTURE\n");
///
/// let mut buffer = [0u8; 16];
/// let outcome = handle.read(&mut buffer, Duration::from_millis(10)).unwrap();
/// assert_eq!(outcome, ReadOutcome::Data(8));
/// assert_eq!(&buffer[..8], b"CAPTURE\n");
/// ```
#[derive(Clone)]
pub struct MockDeviceHandle {
    name: String,
    state: Arc<(Mutex<MockHandleState>, Condvar)>,
}

impl MockDeviceHandle {
    /// Create a new mock handle with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new((Mutex::new(MockHandleState::default()), Condvar::new())),
        }
    }

    /// Queue one chunk to be returned by a subsequent read.
    pub fn enqueue_read(&self, data: &[u8]) {
        let (lock, cond) = &*self.state;
        lock.lock().read_queue.push_back(data.to_vec());
        cond.notify_all();
    }

    /// Queue an I/O error to be returned by a subsequent read.
    pub fn enqueue_error(&self, kind: std::io::ErrorKind) {
        let (lock, cond) = &*self.state;
        lock.lock().error_queue.push_back(kind);
        cond.notify_all();
    }

    /// Make `claim_interface` fail.
    pub fn set_unclaimable(&self, unclaimable: bool) {
        self.state.0.lock().unclaimable = unclaimable;
    }

    /// Make every read sleep for `stall`, ignoring `close` meanwhile.
    pub fn set_stall(&self, stall: Option<Duration>) {
        self.state.0.lock().stall = stall;
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.0.lock().closed
    }

    /// Whether the interface has been claimed.
    pub fn is_claimed(&self) -> bool {
        self.state.0.lock().claimed
    }

    /// Number of read calls so far.
    pub fn read_count(&self) -> u64 {
        self.state.0.lock().reads
    }

    /// Number of chunks still waiting to be read.
    pub fn pending_chunks(&self) -> usize {
        self.state.0.lock().read_queue.len()
    }
}

impl DeviceHandle for MockDeviceHandle {
    fn claim_interface(&self) -> Result<(), PortError> {
        let mut state = self.state.0.lock();
        if state.closed {
            return Err(PortError::Closed);
        }
        if state.unclaimable {
            return Err(PortError::no_interface(&self.name));
        }
        state.claimed = true;
        Ok(())
    }

    fn read(&self, buffer: &mut [u8], timeout: Duration) -> Result<ReadOutcome, PortError> {
        let (lock, cond) = &*self.state;

        let stall = lock.lock().stall;
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }

        let deadline = Instant::now() + timeout;
        let mut state = lock.lock();
        state.reads += 1;
        loop {
            if state.closed {
                return Err(PortError::Closed);
            }
            if let Some(kind) = state.error_queue.pop_front() {
                return Err(PortError::Io(std::io::Error::new(kind, "mock read error")));
            }
            if let Some(mut chunk) = state.read_queue.pop_front() {
                let n = chunk.len().min(buffer.len());
                buffer[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    // Leave the remainder for the next read.
                    state.read_queue.push_front(chunk.split_off(n));
                }
                return Ok(ReadOutcome::Data(n));
            }
            if cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(ReadOutcome::Timeout);
            }
        }
    }

    fn close(&self) {
        let (lock, cond) = &*self.state;
        lock.lock().closed = true;
        cond.notify_all();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MockDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDeviceHandle")
            .field("name", &self.name)
            .field("pending_chunks", &self.pending_chunks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MockTransportState {
    devices: Vec<DeviceIdentity>,
    subscribers: Vec<(SubscriptionId, EventSender)>,
    permission_listeners: Vec<(SubscriptionId, EventSender)>,
    granted: HashSet<DeviceIdentity>,
    permission_requests: Vec<DeviceIdentity>,
    /// Handles handed out by `open`, keyed by device name.
    handles: HashMap<String, MockDeviceHandle>,
    failing_opens: HashSet<String>,
    open_count: u64,
    fail_unsubscribe: bool,
    next_id: u64,
}

impl MockTransportState {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Mock transport for tests.
///
/// This implementation allows you to:
/// - Attach and detach devices, notifying subscribers
/// - Pre-grant permission or answer pending requests later
/// - Script the handle each device opens to
/// - Simulate open and unsubscribe failures
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    /// Create an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and notify every subscriber.
    pub fn attach(&self, device: DeviceIdentity) {
        let mut state = self.state.lock();
        if !state.devices.contains(&device) {
            state.devices.push(device.clone());
        }
        for (_, sink) in &state.subscribers {
            let _ = sink.send(ChannelEvent::DeviceAttached(device.clone()));
        }
    }

    /// Add a device to the attached list without notifying anyone.
    pub fn attach_silently(&self, device: DeviceIdentity) {
        let mut state = self.state.lock();
        if !state.devices.contains(&device) {
            state.devices.push(device);
        }
    }

    /// Detach a device and notify every subscriber.
    pub fn detach(&self, device: &DeviceIdentity) {
        let mut state = self.state.lock();
        state.devices.retain(|d| d != device);
        for (_, sink) in &state.subscribers {
            let _ = sink.send(ChannelEvent::DeviceDetached(device.clone()));
        }
    }

    /// Mark `device` as already accessible.
    pub fn grant(&self, device: &DeviceIdentity) {
        self.state.lock().granted.insert(device.clone());
    }

    /// Deliver a permission result to the registered listeners.
    ///
    /// With no listener registered the answer is lost.
    pub fn answer_permission(&self, device: &DeviceIdentity, granted: bool) {
        let mut state = self.state.lock();
        if granted {
            state.granted.insert(device.clone());
        }
        for (_, sink) in &state.permission_listeners {
            let _ = sink.send(ChannelEvent::PermissionResult {
                device: device.clone(),
                granted,
            });
        }
    }

    /// Get (creating if needed) the handle `open` returns for `name`.
    pub fn handle_for(&self, name: &str) -> MockDeviceHandle {
        self.state
            .lock()
            .handles
            .entry(name.to_string())
            .or_insert_with(|| MockDeviceHandle::new(name))
            .clone()
    }

    /// Make `open` fail for `name`.
    pub fn fail_open(&self, name: &str) {
        self.state.lock().failing_opens.insert(name.to_string());
    }

    /// Make `unsubscribe`/`unregister_permission_listener` fail.
    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.state.lock().fail_unsubscribe = fail;
    }

    /// Devices passed to `request_permission` so far.
    pub fn permission_requests(&self) -> Vec<DeviceIdentity> {
        self.state.lock().permission_requests.clone()
    }

    /// Number of active attach/detach subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Number of registered permission listeners.
    pub fn permission_listener_count(&self) -> usize {
        self.state.lock().permission_listeners.len()
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u64 {
        self.state.lock().open_count
    }
}

impl Transport for MockTransport {
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, PortError> {
        Ok(self.state.lock().devices.clone())
    }

    fn subscribe(&self, sink: EventSender) -> Result<SubscriptionId, PortError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.subscribers.push((id, sink));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.fail_unsubscribe {
            return Err(PortError::config("mock unsubscribe failure"));
        }
        state.subscribers.retain(|(sid, _)| *sid != id);
        Ok(())
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        self.state.lock().granted.contains(device)
    }

    fn register_permission_listener(
        &self,
        sink: EventSender,
    ) -> Result<SubscriptionId, PortError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.permission_listeners.push((id, sink));
        Ok(id)
    }

    fn unregister_permission_listener(&self, id: SubscriptionId) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.fail_unsubscribe {
            return Err(PortError::config("mock unregister failure"));
        }
        state.permission_listeners.retain(|(sid, _)| *sid != id);
        Ok(())
    }

    fn request_permission(&self, device: &DeviceIdentity) -> Result<(), PortError> {
        self.state.lock().permission_requests.push(device.clone());
        Ok(())
    }

    fn open(
        &self,
        device: &DeviceIdentity,
        _settings: &LineSettings,
    ) -> Result<Box<dyn DeviceHandle>, PortError> {
        let mut state = self.state.lock();
        if state.failing_opens.contains(&device.name) {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mock open failure",
            )));
        }
        if !state.devices.contains(device) {
            return Err(PortError::not_found(&device.name));
        }
        state.open_count += 1;
        let handle = state
            .handles
            .entry(device.name.clone())
            .or_insert_with(|| MockDeviceHandle::new(&device.name));
        // A closed handle stays closed; reopening hands out a fresh one.
        if handle.is_closed() {
            *handle = MockDeviceHandle::new(&device.name);
        }
        Ok(Box::new(handle.clone()))
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("devices", &state.devices.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(0x1209, 0xC550, "MOCK0")
    }

    #[test]
    fn test_enqueue_and_read() {
        let handle = MockDeviceHandle::new("MOCK0");
        handle.enqueue_read(b"Hello");

        let mut buffer = [0u8; 10];
        let outcome = handle.read(&mut buffer, Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, ReadOutcome::Data(5));
        assert_eq!(&buffer[..5], b"Hello");
    }

    #[test]
    fn test_partial_read_keeps_remainder() {
        let handle = MockDeviceHandle::new("MOCK0");
        handle.enqueue_read(b"Hello, World!");

        let mut buffer = [0u8; 5];
        let outcome = handle.read(&mut buffer, Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, ReadOutcome::Data(5));
        assert_eq!(&buffer, b"Hello");
        assert_eq!(handle.pending_chunks(), 1);
    }

    #[test]
    fn test_empty_read_times_out() {
        let handle = MockDeviceHandle::new("MOCK0");
        let mut buffer = [0u8; 10];
        let outcome = handle.read(&mut buffer, Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, ReadOutcome::Timeout);
    }

    #[test]
    fn test_close_unblocks_read() {
        let handle = MockDeviceHandle::new("MOCK0");
        let reader = handle.clone();
        let worker = std::thread::spawn(move || {
            let mut buffer = [0u8; 10];
            reader.read(&mut buffer, Duration::from_secs(5))
        });

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        handle.close();
        let result = worker.join().unwrap();

        assert!(matches!(result, Err(PortError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_error_injection() {
        let handle = MockDeviceHandle::new("MOCK0");
        handle.enqueue_error(std::io::ErrorKind::BrokenPipe);
        let mut buffer = [0u8; 4];
        let result = handle.read(&mut buffer, Duration::from_millis(10));
        assert!(matches!(result, Err(PortError::Io(_))));
    }

    #[test]
    fn test_unclaimable_handle() {
        let handle = MockDeviceHandle::new("MOCK0");
        handle.set_unclaimable(true);
        assert!(matches!(
            handle.claim_interface(),
            Err(PortError::NoClaimableInterface(_))
        ));
        assert!(!handle.is_claimed());
    }

    #[test]
    fn test_attach_notifies_subscribers() {
        let transport = MockTransport::new();
        let (tx, rx) = event::channel();
        transport.subscribe(tx).unwrap();

        transport.attach(device());
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::DeviceAttached(device()));
        assert_eq!(transport.list_devices().unwrap(), vec![device()]);
    }

    #[test]
    fn test_permission_answer_without_listener_is_lost() {
        let transport = MockTransport::new();
        transport.answer_permission(&device(), true);

        let (tx, rx) = event::channel();
        transport.register_permission_listener(tx).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_open_unknown_device_fails() {
        let transport = MockTransport::new();
        let result = transport.open(&device(), &LineSettings::default());
        assert!(matches!(result, Err(PortError::NotFound(_))));
    }
}
