//! Attach/detach tracking for the target controller.

use crate::error::ChannelResult;
use crate::event::EventSender;
use crate::port::{DeviceIdentity, SubscriptionId, TargetDevice, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// A filtered hotplug event for the target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Attached(DeviceIdentity),
    Detached(DeviceIdentity),
}

/// Filters the transport's raw hotplug stream down to one vendor/product pair.
///
/// The transport delivers raw events to the orchestrator queue; the
/// orchestrator feeds them back through [`on_attached`](Self::on_attached) and
/// [`on_detached`](Self::on_detached) on its own thread.
#[derive(Debug)]
pub struct DeviceWatcher {
    transport: Arc<dyn Transport>,
    target: TargetDevice,
    subscription: Option<SubscriptionId>,
    attached: HashSet<DeviceIdentity>,
}

impl DeviceWatcher {
    pub fn new(transport: Arc<dyn Transport>, target: TargetDevice) -> Self {
        Self {
            transport,
            target,
            subscription: None,
            attached: HashSet::new(),
        }
    }

    /// Subscribe to hotplug events and scan for an already-connected device.
    ///
    /// Returns the synthesized `Attached` event for a device found by the
    /// scan. Calling this while already started does nothing.
    pub fn start(&mut self, sink: EventSender) -> ChannelResult<Vec<WatchEvent>> {
        if self.subscription.is_some() {
            return Ok(Vec::new());
        }

        self.subscription = Some(self.transport.subscribe(sink)?);
        info!(
            vendor_id = %format!("0x{:04x}", self.target.vendor_id),
            product_id = %format!("0x{:04x}", self.target.product_id),
            "Watching for controller"
        );

        let devices = match self.transport.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Initial device scan failed: {}", e);
                Vec::new()
            }
        };

        let mut events = Vec::new();
        if let Some(device) = devices.into_iter().find(|d| d.matches(self.target)) {
            info!(device = %device, "Controller already connected");
            self.attached.insert(device.clone());
            events.push(WatchEvent::Attached(device));
        }
        Ok(events)
    }

    /// Unsubscribe. Failures are logged and swallowed.
    pub fn stop(&mut self) {
        if let Some(id) = self.subscription.take() {
            if let Err(e) = self.transport.unsubscribe(id) {
                warn!("Failed to unsubscribe from hotplug events: {}", e);
            }
            debug!("Stopped watching for controller");
        }
        self.attached.clear();
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn target(&self) -> TargetDevice {
        self.target
    }

    /// Filter a raw attach event.
    pub fn on_attached(&mut self, device: DeviceIdentity) -> Option<WatchEvent> {
        if !self.is_running() {
            return None;
        }
        if !device.matches(self.target) {
            trace!(device = %device, "Ignoring unrelated device");
            return None;
        }
        if !self.attached.insert(device.clone()) {
            debug!(device = %device, "Duplicate attach ignored");
            return None;
        }
        info!(device = %device, "Controller attached");
        Some(WatchEvent::Attached(device))
    }

    /// Filter a raw detach event. Only devices previously reported attached
    /// produce a `Detached` event.
    pub fn on_detached(&mut self, device: DeviceIdentity) -> Option<WatchEvent> {
        if !self.is_running() || !device.matches(self.target) {
            return None;
        }
        if self.attached.remove(&device) {
            info!(device = %device, "Controller detached");
            Some(WatchEvent::Detached(device))
        } else {
            None
        }
    }
}
