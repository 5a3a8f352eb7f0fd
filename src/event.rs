//! Events carried into the orchestrator's consumer thread.
//!
//! Every producer that may run on a foreign thread (transport hotplug monitor,
//! permission callbacks, the session read thread, host signal handlers) talks
//! to the orchestrator only by sending a [`ChannelEvent`]. The orchestrator
//! owns the receiving end and is the only place channel state is mutated.

use crate::port::DeviceIdentity;
use std::sync::mpsc;
use std::time::Instant;

/// Message delivered to the orchestrator queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A device appeared on the transport (unfiltered).
    DeviceAttached(DeviceIdentity),
    /// A device disappeared from the transport (unfiltered).
    DeviceDetached(DeviceIdentity),
    /// Answer to an asynchronous permission request.
    PermissionResult {
        device: DeviceIdentity,
        granted: bool,
    },
    /// One trimmed, non-empty line extracted by a read session.
    LineReceived {
        /// Identifier of the session that produced the line.
        session_id: u64,
        line: String,
        received_at: Instant,
    },
    /// Ask a running event loop to return.
    Shutdown,
}

/// Sending half of the orchestrator queue.
pub type EventSender = mpsc::Sender<ChannelEvent>;

/// Receiving half of the orchestrator queue.
pub type EventReceiver = mpsc::Receiver<ChannelEvent>;

/// Create a new unbounded event queue.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel()
}
