//! The channel's lifecycle and event loop.
//!
//! ```text
//! hotplug thread ──┐
//! permission cb  ──┼──> mpsc<ChannelEvent> ──> ChannelOrchestrator ──> CommandDispatcher ──> CommandReceiver
//! read thread    ──┤                               │
//! host / signals ──┘                               └──> ChannelObserver
//! ```
//!
//! Every collaborator that runs on a foreign thread only posts events. The
//! orchestrator drains them on whichever thread calls
//! [`process_pending`](ChannelOrchestrator::process_pending) or
//! [`run_until_shutdown`](ChannelOrchestrator::run_until_shutdown), and that
//! thread is the only one that touches channel state.

use crate::command::{self, Command};
use crate::config::Config;
use crate::dispatch::{CommandDispatcher, CommandReceiver, DispatchOutcome, DEFAULT_MIN_INTERVAL};
use crate::error::{ChannelError, ChannelResult};
use crate::event::{self, ChannelEvent, EventReceiver, EventSender};
use crate::permission::{AccessRequest, PermissionDecision, PermissionNegotiator};
use crate::port::{DeviceIdentity, TargetDevice, Transport};
use crate::session::{LineSink, SerialSession, SessionConfig, SessionStatus};
use crate::state::ChannelState;
use crate::watcher::{DeviceWatcher, WatchEvent};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Notifications for the host application.
///
/// Called on the orchestrator's thread. A panicking observer is logged and
/// otherwise ignored.
pub trait ChannelObserver: Send {
    fn on_connection_state_changed(&mut self, _connected: bool) {}

    fn on_command_dispatched(&mut self, _command: &Command, _outcome: &DispatchOutcome) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ChannelObserver for NullObserver {}

/// Settings for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub target: TargetDevice,
    pub session: SessionConfig,
    pub min_interval: Duration,
    /// How often `run_until_shutdown` wakes to check the session when idle.
    pub idle_check_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target: TargetDevice::default(),
            session: SessionConfig::default(),
            min_interval: DEFAULT_MIN_INTERVAL,
            idle_check_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            target: config.device.target(),
            session: config.serial.session_config(),
            min_interval: config.dispatch.min_interval(),
            ..Default::default()
        }
    }
}

/// Owns the single active device and session and drives the state machine.
pub struct ChannelOrchestrator {
    transport: Arc<dyn Transport>,
    watcher: DeviceWatcher,
    negotiator: PermissionNegotiator,
    dispatcher: CommandDispatcher,
    observer: Box<dyn ChannelObserver>,
    config: OrchestratorConfig,
    events_tx: EventSender,
    events_rx: EventReceiver,
    current_device: Option<DeviceIdentity>,
    session: Option<SerialSession>,
    state: ChannelState,
}

impl ChannelOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        receiver: Box<dyn CommandReceiver>,
        observer: Box<dyn ChannelObserver>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events_tx, events_rx) = event::channel();
        Self {
            watcher: DeviceWatcher::new(Arc::clone(&transport), config.target),
            negotiator: PermissionNegotiator::new(Arc::clone(&transport)),
            dispatcher: CommandDispatcher::new(receiver, config.min_interval),
            transport,
            observer,
            config,
            events_tx,
            events_rx,
            current_device: None,
            session: None,
            state: ChannelState::Stopped,
        }
    }

    /// Register for permission results and start watching.
    ///
    /// A controller that is already attached is handled before this returns;
    /// if access is already held it is opened right away. Calling `start`
    /// on a running channel does nothing.
    pub fn start(&mut self) -> ChannelResult<()> {
        match self.state {
            ChannelState::Destroyed => return Err(ChannelError::Destroyed),
            ChannelState::Stopped => {}
            _ => return Ok(()),
        }

        self.negotiator.register(self.events_tx.clone())?;
        let initial = match self.watcher.start(self.events_tx.clone()) {
            Ok(events) => events,
            Err(e) => {
                self.negotiator.unregister();
                return Err(e);
            }
        };

        self.set_state(ChannelState::Watching);
        for event in initial {
            self.on_watch_event(event);
        }
        Ok(())
    }

    /// Close any session and stop watching. Safe from any state.
    pub fn stop(&mut self) {
        if matches!(self.state, ChannelState::Stopped | ChannelState::Destroyed) {
            return;
        }
        let had_session = self.close_session();
        self.watcher.stop();
        self.negotiator.unregister();
        self.set_state(ChannelState::Stopped);
        if had_session {
            self.notify_connection(false);
        }
    }

    /// Stop and release everything. The orchestrator cannot be restarted.
    pub fn destroy(&mut self) {
        if self.state == ChannelState::Destroyed {
            return;
        }
        self.stop();
        self.current_device = None;
        self.set_state(ChannelState::Destroyed);
    }

    /// A sender hosts can use to post events, typically `Shutdown`.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// The device most recently seen attached, if any.
    pub fn current_device(&self) -> Option<&DeviceIdentity> {
        self.current_device.as_ref()
    }

    /// Whether a session is open and its read thread alive.
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(SerialSession::is_connected)
            .unwrap_or(false)
    }

    pub fn session_status(&self) -> Option<SessionStatus> {
        self.session.as_ref().map(SerialSession::status)
    }

    /// Handle every queued event without blocking. Returns how many were
    /// handled. A queued `Shutdown` is consumed and ignored here.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return handled,
            }
        }
    }

    /// Block handling events until `Shutdown` arrives.
    pub fn run_until_shutdown(&mut self) {
        info!(state = %self.state, "Event loop running");
        loop {
            match self.events_rx.recv_timeout(self.config.idle_check_interval) {
                Ok(ChannelEvent::Shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => self.reap_dead_session(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        if !self.state.is_active() {
            trace!(?event, state = %self.state, "Ignoring event while inactive");
            return;
        }
        match event {
            ChannelEvent::DeviceAttached(device) => {
                if let Some(event) = self.watcher.on_attached(device) {
                    self.on_watch_event(event);
                }
            }
            ChannelEvent::DeviceDetached(device) => {
                if let Some(event) = self.watcher.on_detached(device) {
                    self.on_watch_event(event);
                }
            }
            ChannelEvent::PermissionResult { device, granted } => {
                match self.negotiator.on_result(device, granted) {
                    Some(PermissionDecision::Granted(device)) => self.on_permission_granted(device),
                    Some(PermissionDecision::Denied(device)) => self.on_permission_denied(device),
                    None => {}
                }
            }
            ChannelEvent::LineReceived {
                session_id,
                line,
                received_at,
            } => self.on_line(session_id, line, received_at),
            ChannelEvent::Shutdown => {}
        }
    }

    fn on_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Attached(device) => self.on_device_attached(device),
            WatchEvent::Detached(device) => self.on_device_detached(device),
        }
    }

    fn on_device_attached(&mut self, device: DeviceIdentity) {
        self.current_device = Some(device.clone());
        match self.negotiator.request_access(&device) {
            Ok(AccessRequest::Granted) => self.on_permission_granted(device),
            Ok(AccessRequest::Pending) => {
                if self.session.is_none() {
                    self.set_state(ChannelState::PermissionPending { device });
                }
            }
            Err(e) => {
                error!(device = %device, "Permission request failed: {}", e);
                self.notify_connection(false);
            }
        }
    }

    fn on_permission_granted(&mut self, device: DeviceIdentity) {
        if self.current_device.as_ref() != Some(&device) {
            debug!(device = %device, "Ignoring grant for a device that is no longer current");
            return;
        }

        self.close_session();
        let mut session = SerialSession::new(device.clone(), self.config.session.clone());

        if let Err(e) = session.open(self.transport.as_ref()) {
            error!(device = %device, "Failed to open device: {}", e);
            self.set_state(ChannelState::Watching);
            self.notify_connection(false);
            return;
        }

        let sink = line_sink(self.events_tx.clone(), session.id());
        if let Err(e) = session.start_reading(sink) {
            error!(device = %device, "Failed to start read thread: {}", e);
            session.stop();
            self.set_state(ChannelState::Watching);
            self.notify_connection(false);
            return;
        }

        self.session = Some(session);
        self.set_state(ChannelState::Reading { device });
        self.notify_connection(true);
    }

    fn on_permission_denied(&mut self, device: DeviceIdentity) {
        if self.current_device.as_ref() != Some(&device) {
            debug!(device = %device, "Ignoring denial for a device that is no longer current");
            return;
        }
        if self.session.is_none() {
            self.set_state(ChannelState::Watching);
        }
        self.notify_connection(false);
    }

    fn on_device_detached(&mut self, device: DeviceIdentity) {
        if self.current_device.as_ref() != Some(&device) {
            debug!(device = %device, "Ignoring detach of a device that is not current");
            return;
        }
        self.negotiator.cancel(&device);
        self.close_session();
        self.current_device = None;
        self.set_state(ChannelState::Watching);
        self.notify_connection(false);
    }

    fn on_line(&mut self, session_id: u64, line: String, received_at: Instant) {
        let current = self.session.as_ref().map(SerialSession::id);
        if current != Some(session_id) {
            trace!(session = session_id, "Dropping line from a closed session");
            return;
        }

        let command = command::parse_at(&line, received_at);
        let outcome = if command.kind().is_unknown() {
            debug!(raw = command.raw_text(), "Unknown command");
            DispatchOutcome::UnknownCommand
        } else {
            // Spacing is measured between arrivals, not between drains.
            self.dispatcher.dispatch_at(&command, command.received_at())
        };

        let observer = &mut self.observer;
        if panic::catch_unwind(AssertUnwindSafe(|| {
            observer.on_command_dispatched(&command, &outcome)
        }))
        .is_err()
        {
            error!("Observer panicked in on_command_dispatched");
        }
    }

    /// Notice a read thread that exited on its own.
    fn reap_dead_session(&mut self) {
        let dead = matches!(&self.session, Some(s) if !s.is_connected());
        if dead {
            warn!(state = %self.state, "Read thread exited unexpectedly; closing session");
            self.close_session();
            self.set_state(ChannelState::Watching);
            self.notify_connection(false);
        }
    }

    /// Returns whether a session was open.
    fn close_session(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "State change");
            self.state = state;
        }
    }

    fn notify_connection(&mut self, connected: bool) {
        info!(connected, "Connection state changed");
        let observer = &mut self.observer;
        if panic::catch_unwind(AssertUnwindSafe(|| {
            observer.on_connection_state_changed(connected)
        }))
        .is_err()
        {
            error!("Observer panicked in on_connection_state_changed");
        }
    }
}

impl Drop for ChannelOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ChannelOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOrchestrator")
            .field("state", &self.state)
            .field("current_device", &self.current_device)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Sink that forwards lines from the read thread into the queue, tagged
/// with the session they came from.
fn line_sink(events: EventSender, session_id: u64) -> LineSink {
    Box::new(move |line| {
        let _ = events.send(ChannelEvent::LineReceived {
            session_id,
            line,
            received_at: Instant::now(),
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::port::MockTransport;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<&'static str>>>,
        connections: Arc<Mutex<Vec<bool>>>,
        outcomes: Arc<Mutex<Vec<(CommandKind, DispatchOutcome)>>>,
    }

    impl CommandReceiver for Recording {
        fn trigger_capture(&mut self) -> bool {
            self.calls.lock().unwrap().push("capture");
            true
        }

        fn switch_to_normal_mode(&mut self) -> bool {
            self.calls.lock().unwrap().push("normal");
            true
        }

        fn switch_to_fluorescence_mode(&mut self) -> bool {
            self.calls.lock().unwrap().push("fluorescence");
            true
        }

        fn is_guided_session_active(&self) -> bool {
            false
        }
    }

    impl ChannelObserver for Recording {
        fn on_connection_state_changed(&mut self, connected: bool) {
            self.connections.lock().unwrap().push(connected);
        }

        fn on_command_dispatched(&mut self, command: &Command, outcome: &DispatchOutcome) {
            self.outcomes
                .lock()
                .unwrap()
                .push((command.kind(), outcome.clone()));
        }
    }

    impl Recording {
        fn connections(&self) -> Vec<bool> {
            self.connections.lock().unwrap().clone()
        }
    }

    fn controller(name: &str) -> DeviceIdentity {
        DeviceIdentity::new(0x1209, 0xC550, name)
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            session: SessionConfig {
                read_timeout: Duration::from_millis(20),
                join_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            min_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn orchestrator(transport: &MockTransport, rec: &Recording) -> ChannelOrchestrator {
        ChannelOrchestrator::new(
            Arc::new(transport.clone()),
            Box::new(rec.clone()),
            Box::new(rec.clone()),
            config(),
        )
    }

    fn pump_until(orch: &mut ChannelOrchestrator, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            orch.process_pending();
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_pre_granted_device_opens_during_start() {
        let transport = MockTransport::new();
        transport.attach_silently(controller("/dev/ttyACM0"));
        transport.grant(&controller("/dev/ttyACM0"));
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);

        orch.start().unwrap();

        assert!(orch.state().is_reading());
        assert!(orch.is_connected());
        assert!(transport.permission_requests().is_empty());
        assert_eq!(rec.connections(), vec![true]);
    }

    #[test]
    fn test_permission_round_trip() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();
        assert_eq!(orch.state(), &ChannelState::Watching);

        let dev = controller("/dev/ttyACM0");
        transport.attach(dev.clone());
        orch.process_pending();
        assert_eq!(
            orch.state(),
            &ChannelState::PermissionPending { device: dev.clone() }
        );
        assert_eq!(transport.permission_requests(), vec![dev.clone()]);

        transport.answer_permission(&dev, true);
        orch.process_pending();
        assert_eq!(orch.state(), &ChannelState::Reading { device: dev });
        assert_eq!(rec.connections(), vec![true]);
    }

    #[test]
    fn test_denied_permission_reports_disconnected() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        let dev = controller("/dev/ttyACM0");
        transport.attach(dev.clone());
        orch.process_pending();
        transport.answer_permission(&dev, false);
        orch.process_pending();

        assert_eq!(orch.state(), &ChannelState::Watching);
        assert_eq!(rec.connections(), vec![false]);
        assert_eq!(transport.open_count(), 0);
    }

    #[test]
    fn test_grant_for_stale_device_is_ignored() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        let dev = controller("/dev/ttyACM0");
        transport.attach(dev.clone());
        orch.process_pending();
        transport.detach(&dev);
        orch.process_pending();
        transport.answer_permission(&dev, true);
        orch.process_pending();

        assert_eq!(transport.open_count(), 0);
        assert!(!orch.is_connected());
        assert_eq!(orch.current_device(), None);
    }

    #[test]
    fn test_repeated_grant_keeps_live_session() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        let dev = controller("/dev/ttyACM0");
        transport.attach(dev.clone());
        orch.process_pending();
        transport.answer_permission(&dev, true);
        orch.process_pending();
        let session_id = orch.session_status().map(|s| s.session_id);

        transport.answer_permission(&dev, true);
        orch.process_pending();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(orch.session_status().map(|s| s.session_id), session_id);
        assert_eq!(rec.connections(), vec![true]);
    }

    #[test]
    fn test_lines_are_dispatched_in_order() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        let handle = transport.handle_for(&dev.name);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        handle.enqueue_read(b"CAPTURE\nU");
        handle.enqueue_read(b"V\nBADCMD\nRGB\n");

        let outcomes = Arc::clone(&rec.outcomes);
        assert!(pump_until(&mut orch, || outcomes.lock().unwrap().len() == 4));

        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["capture", "fluorescence", "normal"]
        );
        let outcomes = rec.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes[2], (CommandKind::Unknown, DispatchOutcome::UnknownCommand));
    }

    #[test]
    fn test_detach_of_current_device_closes_session() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        let handle = transport.handle_for(&dev.name);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        transport.detach(&dev);
        orch.process_pending();

        assert!(handle.is_closed());
        assert_eq!(orch.state(), &ChannelState::Watching);
        assert_eq!(orch.current_device(), None);
        assert_eq!(rec.connections(), vec![true, false]);
    }

    #[test]
    fn test_detach_of_other_device_is_ignored() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        transport.detach(&DeviceIdentity::new(0x0403, 0x6001, "/dev/ttyUSB0"));
        orch.process_pending();

        assert!(orch.is_connected());
        assert_eq!(rec.connections(), vec![true]);
    }

    #[test]
    fn test_open_failure_leaves_no_session() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        transport.fail_open(&dev.name);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);

        orch.start().unwrap();

        assert!(!orch.is_connected());
        assert!(orch.session_status().is_none());
        assert_eq!(orch.state(), &ChannelState::Watching);
        assert_eq!(rec.connections(), vec![false]);
    }

    #[test]
    fn test_stop_reports_disconnect_and_is_idempotent() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        orch.stop();
        orch.stop();

        assert_eq!(orch.state(), &ChannelState::Stopped);
        assert_eq!(transport.subscriber_count(), 0);
        assert_eq!(transport.permission_listener_count(), 0);
        assert_eq!(rec.connections(), vec![true, false]);
    }

    #[test]
    fn test_start_after_stop_rescans() {
        let transport = MockTransport::new();
        let dev = controller("/dev/ttyACM0");
        transport.attach_silently(dev.clone());
        transport.grant(&dev);
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);

        orch.start().unwrap();
        orch.stop();
        orch.start().unwrap();

        assert!(orch.is_connected());
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn test_destroyed_orchestrator_cannot_start() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();
        orch.destroy();

        assert_eq!(orch.state(), &ChannelState::Destroyed);
        assert!(matches!(orch.start(), Err(ChannelError::Destroyed)));
    }

    #[test]
    fn test_run_until_shutdown_returns_on_shutdown() {
        let transport = MockTransport::new();
        let rec = Recording::default();
        let mut orch = orchestrator(&transport, &rec);
        orch.start().unwrap();

        let sender = orch.event_sender();
        sender.send(ChannelEvent::Shutdown).unwrap();
        orch.run_until_shutdown();
        assert_eq!(orch.state(), &ChannelState::Watching);
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.dispatch.min_interval_ms = 350;
        config.device.product_id = 0xC551;
        let oc = OrchestratorConfig::from(&config);
        assert_eq!(oc.min_interval, Duration::from_millis(350));
        assert_eq!(oc.target, TargetDevice::new(0x1209, 0xC551));
    }
}
