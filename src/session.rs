//! Serial read session.
//!
//! A [`SerialSession`] owns one open device handle and at most one read
//! thread. The thread performs timeout-bounded blocking reads, reassembles
//! lines with [`LineAssembler`] and hands every line to a [`LineSink`]. The
//! sink runs on the read thread, so the orchestrator's sink does nothing but
//! post to its queue.

use crate::frame::LineAssembler;
use crate::port::{DeviceHandle, DeviceIdentity, LineSettings, PortError, ReadOutcome, Transport};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Receives each extracted line on the read thread.
pub type LineSink = Box<dyn FnMut(String) + Send>;

const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);
const PARTIAL_LOG_INTERVAL: Duration = Duration::from_secs(3);
/// Pause after a failed read so a dead handle cannot spin the thread.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);
const HEX_PREVIEW_BYTES: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables for a read session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Line settings applied on open.
    pub line_settings: LineSettings,
    /// Upper bound for one blocking read.
    pub read_timeout: Duration,
    /// Size of the fixed read buffer.
    pub read_buffer_size: usize,
    /// How long `stop` waits for the read thread.
    pub join_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_settings: LineSettings::default(),
            read_timeout: Duration::from_millis(1000),
            read_buffer_size: 1024,
            join_timeout: Duration::from_millis(1000),
        }
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Opened,
    Reading,
    Closed,
}

/// Point-in-time view of a session, for status displays and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub device: String,
    pub phase: SessionPhase,
    pub worker_alive: bool,
    pub bytes_received: u64,
    pub lines_delivered: u64,
    pub overflow_resets: u64,
}

#[derive(Debug, Default)]
struct SessionCounters {
    bytes_received: AtomicU64,
    lines_delivered: AtomicU64,
    overflow_resets: AtomicU64,
}

struct Worker {
    thread: JoinHandle<()>,
    /// Disconnects when the thread exits, including by panic.
    done: mpsc::Receiver<()>,
}

/// One open connection to the controller plus its read thread.
pub struct SerialSession {
    id: u64,
    device: DeviceIdentity,
    config: SessionConfig,
    handle: Option<Arc<dyn DeviceHandle>>,
    worker: Option<Worker>,
    stop_requested: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    phase: SessionPhase,
}

impl SerialSession {
    pub fn new(device: DeviceIdentity, config: SessionConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            device,
            config,
            handle: None,
            worker: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SessionCounters::default()),
            phase: SessionPhase::Idle,
        }
    }

    /// Unique id of this session within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Open the device and claim its interface.
    ///
    /// Fails closed: if the interface cannot be claimed the handle is closed
    /// again and the session keeps no state. Opening an open or closed
    /// session is rejected.
    pub fn open(&mut self, transport: &dyn Transport) -> Result<(), PortError> {
        match self.phase {
            SessionPhase::Idle => {}
            SessionPhase::Closed => return Err(PortError::Closed),
            SessionPhase::Opened | SessionPhase::Reading => return Err(PortError::AlreadyOpen),
        }

        let handle: Arc<dyn DeviceHandle> =
            Arc::from(transport.open(&self.device, &self.config.line_settings)?);
        if let Err(e) = handle.claim_interface() {
            warn!(device = %self.device, "Failed to claim interface: {}", e);
            handle.close();
            return Err(e);
        }

        info!(device = %self.device, session = self.id, "Device opened");
        self.handle = Some(handle);
        self.phase = SessionPhase::Opened;
        Ok(())
    }

    /// Spawn the read thread. Each extracted line is passed to `sink`.
    pub fn start_reading(&mut self, sink: LineSink) -> Result<(), PortError> {
        match self.phase {
            SessionPhase::Opened => {}
            SessionPhase::Reading => return Err(PortError::AlreadyOpen),
            SessionPhase::Idle => return Err(PortError::NotOpen),
            SessionPhase::Closed => return Err(PortError::Closed),
        }
        let handle = self.handle.clone().ok_or(PortError::NotOpen)?;

        let (done_tx, done_rx) = mpsc::channel();
        let reader = ReadLoop {
            session_id: self.id,
            handle,
            sink,
            stop_requested: Arc::clone(&self.stop_requested),
            counters: Arc::clone(&self.counters),
            read_timeout: self.config.read_timeout,
            read_buffer_size: self.config.read_buffer_size,
        };

        let thread = thread::Builder::new()
            .name("serial-read".to_string())
            .spawn(move || {
                let _done = done_tx;
                reader.run();
            })?;

        self.worker = Some(Worker {
            thread,
            done: done_rx,
        });
        self.phase = SessionPhase::Reading;
        debug!(session = self.id, "Read thread started");
        Ok(())
    }

    /// Stop reading and release the device.
    ///
    /// The handle is closed first so a blocked read returns; the read thread
    /// is then given `join_timeout` to finish before it is abandoned.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.stop_requested.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            handle.close();
        }

        if let Some(worker) = self.worker.take() {
            match worker.done.recv_timeout(self.config.join_timeout) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        session = self.id,
                        timeout_ms = self.config.join_timeout.as_millis() as u64,
                        "Read thread did not finish in time; abandoning it"
                    );
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if worker.thread.join().is_err() {
                        error!(session = self.id, "Read thread panicked");
                    }
                }
            }
        }

        if self.phase != SessionPhase::Idle {
            info!(device = %self.device, session = self.id, "Session closed");
        }
        self.phase = SessionPhase::Closed;
    }

    /// Handle present, not stopping, and the read thread still alive.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
            && !self.stop_requested.load(Ordering::Acquire)
            && self.worker_alive()
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.thread.is_finished())
            .unwrap_or(false)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            device: self.device.name.clone(),
            phase: self.phase,
            worker_alive: self.worker_alive(),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            lines_delivered: self.counters.lines_delivered.load(Ordering::Relaxed),
            overflow_resets: self.counters.overflow_resets.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSession")
            .field("id", &self.id)
            .field("device", &self.device.name)
            .field("phase", &self.phase)
            .finish()
    }
}

/// State moved onto the read thread.
struct ReadLoop {
    session_id: u64,
    handle: Arc<dyn DeviceHandle>,
    sink: LineSink,
    stop_requested: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    read_timeout: Duration,
    read_buffer_size: usize,
}

impl ReadLoop {
    fn run(mut self) {
        let mut buffer = vec![0u8; self.read_buffer_size.max(1)];
        let mut assembler = LineAssembler::new(self.read_buffer_size);
        let mut throttle = LogThrottle::new();

        debug!(session = self.session_id, device = self.handle.name(), "Read loop running");

        while !self.stopping() {
            match self.handle.read(&mut buffer, self.read_timeout) {
                Ok(ReadOutcome::Data(0)) | Ok(ReadOutcome::Timeout) => {
                    if throttle.idle.ready() {
                        debug!(session = self.session_id, "No data from controller");
                    }
                }
                Ok(ReadOutcome::Data(n)) => {
                    let chunk = &buffer[..n];
                    self.counters
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    trace!(
                        session = self.session_id,
                        bytes = n,
                        hex = %hex_preview(chunk),
                        "Received chunk"
                    );

                    let resets_before = assembler.overflow_resets();
                    for line in assembler.push(chunk) {
                        self.deliver(line);
                    }
                    if assembler.overflow_resets() != resets_before {
                        self.counters.overflow_resets.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(PortError::Closed) => {
                    debug!(session = self.session_id, "Device handle closed");
                    break;
                }
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    if throttle.error.ready() {
                        warn!(session = self.session_id, "Read error: {}", e);
                    }
                    thread::sleep(ERROR_BACKOFF);
                }
            }

            if !assembler.is_empty() && throttle.partial.ready() {
                debug!(
                    session = self.session_id,
                    pending = assembler.len(),
                    "Waiting for line terminator"
                );
            }
        }

        debug!(session = self.session_id, "Read loop exited");
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn deliver(&mut self, line: String) {
        debug!(session = self.session_id, line = %line, "Line received");
        let sink = &mut self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| sink(line))).is_err() {
            error!(session = self.session_id, "Line handler panicked; continuing");
            return;
        }
        self.counters.lines_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Rate limits for the read loop's repetitive diagnostics.
struct LogThrottle {
    idle: Every,
    error: Every,
    partial: Every,
}

impl LogThrottle {
    fn new() -> Self {
        Self {
            idle: Every::new(IDLE_LOG_INTERVAL),
            error: Every::new(ERROR_LOG_INTERVAL),
            partial: Every::new(PARTIAL_LOG_INTERVAL),
        }
    }
}

struct Every {
    interval: Duration,
    last: Option<Instant>,
}

impl Every {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let mut out: String = bytes
        .iter()
        .take(HEX_PREVIEW_BYTES)
        .map(|b| format!("{b:02x}"))
        .collect();
    if bytes.len() > HEX_PREVIEW_BYTES {
        out.push_str("...");
    }
    out
}
