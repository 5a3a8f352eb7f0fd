//! Shared test utilities for command channel tests.
//!
//! This module provides common test infrastructure including:
//! - A recording command receiver with a switchable accept/reject answer
//! - A recording observer
//! - Orchestrator builders wired to a `MockTransport`
//! - Polling helpers for work done on the read thread

#![allow(dead_code)]

use serial_command_channel::port::{DeviceIdentity, MockTransport};
use serial_command_channel::{
    ChannelObserver, ChannelOrchestrator, Command, CommandKind, CommandReceiver, DispatchOutcome,
    OrchestratorConfig, SessionConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Vendor/product pair of the controller used throughout the tests.
pub const VENDOR_ID: u16 = 0x1209;
pub const PRODUCT_ID: u16 = 0xC550;

/// Identity of a matching controller at `name`.
pub fn controller(name: &str) -> DeviceIdentity {
    DeviceIdentity::new(VENDOR_ID, PRODUCT_ID, name)
}

/// Camera action recorded by [`RecordingReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Capture,
    Normal,
    Fluorescence,
}

/// Command receiver that records every call.
#[derive(Clone)]
pub struct RecordingReceiver {
    actions: Arc<Mutex<Vec<Action>>>,
    accept: Arc<AtomicBool>,
    guided_queries: Arc<Mutex<u32>>,
}

impl RecordingReceiver {
    pub fn accepting() -> Self {
        Self {
            actions: Arc::new(Mutex::new(Vec::new())),
            accept: Arc::new(AtomicBool::new(true)),
            guided_queries: Arc::new(Mutex::new(0)),
        }
    }

    pub fn rejecting() -> Self {
        let receiver = Self::accepting();
        receiver.set_accept(false);
        receiver
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    pub fn guided_queries(&self) -> u32 {
        *self.guided_queries.lock().unwrap()
    }

    fn record(&mut self, action: Action) -> bool {
        self.actions.lock().unwrap().push(action);
        self.accept.load(Ordering::SeqCst)
    }
}

impl CommandReceiver for RecordingReceiver {
    fn trigger_capture(&mut self) -> bool {
        self.record(Action::Capture)
    }

    fn switch_to_normal_mode(&mut self) -> bool {
        self.record(Action::Normal)
    }

    fn switch_to_fluorescence_mode(&mut self) -> bool {
        self.record(Action::Fluorescence)
    }

    fn is_guided_session_active(&self) -> bool {
        *self.guided_queries.lock().unwrap() += 1;
        false
    }
}

/// Observer that records every notification.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    connections: Arc<Mutex<Vec<bool>>>,
    dispatched: Arc<Mutex<Vec<(CommandKind, String, DispatchOutcome)>>>,
}

impl RecordingObserver {
    pub fn connections(&self) -> Vec<bool> {
        self.connections.lock().unwrap().clone()
    }

    pub fn dispatched(&self) -> Vec<(CommandKind, String, DispatchOutcome)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }
}

impl ChannelObserver for RecordingObserver {
    fn on_connection_state_changed(&mut self, connected: bool) {
        self.connections.lock().unwrap().push(connected);
    }

    fn on_command_dispatched(&mut self, command: &Command, outcome: &DispatchOutcome) {
        self.dispatched.lock().unwrap().push((
            command.kind(),
            command.raw_text().to_string(),
            outcome.clone(),
        ));
    }
}

/// Settings with short timeouts so tests stay fast.
pub fn fast_config(min_interval: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        session: SessionConfig {
            read_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        min_interval,
        ..Default::default()
    }
}

/// Everything a flow test needs.
pub struct Harness {
    pub transport: MockTransport,
    pub receiver: RecordingReceiver,
    pub observer: RecordingObserver,
    pub channel: ChannelOrchestrator,
}

impl Harness {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_receiver(RecordingReceiver::accepting(), min_interval)
    }

    pub fn with_receiver(receiver: RecordingReceiver, min_interval: Duration) -> Self {
        let transport = MockTransport::new();
        let observer = RecordingObserver::default();
        let channel = ChannelOrchestrator::new(
            Arc::new(transport.clone()),
            Box::new(receiver.clone()),
            Box::new(observer.clone()),
            fast_config(min_interval),
        );
        Self {
            transport,
            receiver,
            observer,
            channel,
        }
    }

    /// Pump the event queue until `cond` holds or two seconds pass.
    pub fn pump_until(&mut self, mut cond: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            self.channel.process_pending();
            if cond(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Poll `cond` for up to two seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
