//! Access negotiation for a detected device.

use crate::error::{ChannelError, ChannelResult};
use crate::event::EventSender;
use crate::port::{DeviceIdentity, SubscriptionId, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immediate answer to [`PermissionNegotiator::request_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRequest {
    /// Access was already held; proceed now.
    Granted,
    /// A request was issued; the answer arrives as a `PermissionResult` event.
    Pending,
}

/// Final answer for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted(DeviceIdentity),
    Denied(DeviceIdentity),
}

/// Ensures the process holds access to a device before it is opened.
///
/// The listener must be registered before any request is issued: a result
/// produced while nothing is registered is lost by the transport.
/// [`request_access`](Self::request_access) refuses to run unregistered.
#[derive(Debug)]
pub struct PermissionNegotiator {
    transport: Arc<dyn Transport>,
    listener: Option<SubscriptionId>,
    pending: HashSet<DeviceIdentity>,
}

impl PermissionNegotiator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listener: None,
            pending: HashSet::new(),
        }
    }

    /// Register for permission results. Idempotent.
    pub fn register(&mut self, sink: EventSender) -> ChannelResult<()> {
        if self.listener.is_none() {
            self.listener = Some(self.transport.register_permission_listener(sink)?);
            debug!("Permission listener registered");
        }
        Ok(())
    }

    /// Stop receiving results. Failures are logged and swallowed.
    pub fn unregister(&mut self) {
        if let Some(id) = self.listener.take() {
            if let Err(e) = self.transport.unregister_permission_listener(id) {
                warn!("Failed to unregister permission listener: {}", e);
            }
            debug!("Permission listener unregistered");
        }
        self.pending.clear();
    }

    pub fn is_registered(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether a request for `device` is awaiting an answer.
    pub fn is_pending(&self, device: &DeviceIdentity) -> bool {
        self.pending.contains(device)
    }

    /// Make sure the process may open `device`.
    ///
    /// If permission is already held this returns [`AccessRequest::Granted`]
    /// without any round trip; otherwise it issues a transport request.
    pub fn request_access(&mut self, device: &DeviceIdentity) -> ChannelResult<AccessRequest> {
        if !self.is_registered() {
            return Err(ChannelError::NotRegistered);
        }

        if self.transport.has_permission(device) {
            debug!(device = %device, "Permission already held");
            return Ok(AccessRequest::Granted);
        }

        info!(device = %device, "Requesting device permission");
        self.transport.request_permission(device)?;
        self.pending.insert(device.clone());
        Ok(AccessRequest::Pending)
    }

    /// Drop an outstanding request, e.g. because the device went away.
    /// A result arriving for it later is ignored.
    pub fn cancel(&mut self, device: &DeviceIdentity) {
        if self.pending.remove(device) {
            debug!(device = %device, "Pending permission request cancelled");
        }
    }

    /// Turn a transport permission result into a decision.
    ///
    /// Only answers to an outstanding request count. Results arriving while
    /// unregistered, duplicates, and unsolicited grants are dropped.
    pub fn on_result(&mut self, device: DeviceIdentity, granted: bool) -> Option<PermissionDecision> {
        if !self.is_registered() {
            debug!(device = %device, "Dropping permission result; listener not registered");
            return None;
        }
        if !self.pending.remove(&device) {
            debug!(device = %device, granted, "Dropping permission result with no pending request");
            return None;
        }
        if granted {
            info!(device = %device, "Permission granted");
            Some(PermissionDecision::Granted(device))
        } else {
            warn!(device = %device, "Permission denied");
            Some(PermissionDecision::Denied(device))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, ChannelEvent};
    use crate::port::MockTransport;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(0x1209, 0xC550, "/dev/ttyACM0")
    }

    #[test]
    fn test_request_before_register_is_refused() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));

        let result = n.request_access(&device());
        assert!(matches!(result, Err(ChannelError::NotRegistered)));
        assert!(transport.permission_requests().is_empty());
    }

    #[test]
    fn test_already_granted_is_synchronous() {
        let transport = MockTransport::new();
        transport.grant(&device());
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, rx) = event::channel();
        n.register(tx).unwrap();

        assert_eq!(n.request_access(&device()).unwrap(), AccessRequest::Granted);
        assert!(transport.permission_requests().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pending_request_resolves_through_queue() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, rx) = event::channel();
        n.register(tx).unwrap();

        assert_eq!(n.request_access(&device()).unwrap(), AccessRequest::Pending);
        assert!(n.is_pending(&device()));
        assert_eq!(transport.permission_requests(), vec![device()]);

        transport.answer_permission(&device(), false);
        let ev = rx.try_recv().unwrap();
        let ChannelEvent::PermissionResult { device: d, granted } = ev else {
            panic!("expected permission result, got {ev:?}");
        };
        assert_eq!(
            n.on_result(d, granted),
            Some(PermissionDecision::Denied(device()))
        );
        assert!(!n.is_pending(&device()));
    }

    #[test]
    fn test_results_dropped_after_unregister() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, _rx) = event::channel();
        n.register(tx).unwrap();
        n.unregister();

        assert_eq!(n.on_result(device(), true), None);
        assert_eq!(transport.permission_listener_count(), 0);
    }

    #[test]
    fn test_unsolicited_and_duplicate_results_are_dropped() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, _rx) = event::channel();
        n.register(tx).unwrap();

        assert_eq!(n.on_result(device(), true), None);

        assert_eq!(n.request_access(&device()).unwrap(), AccessRequest::Pending);
        assert_eq!(
            n.on_result(device(), true),
            Some(PermissionDecision::Granted(device()))
        );
        assert_eq!(n.on_result(device(), true), None);
    }

    #[test]
    fn test_cancelled_request_ignores_late_result() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, _rx) = event::channel();
        n.register(tx).unwrap();

        n.request_access(&device()).unwrap();
        n.cancel(&device());

        assert!(!n.is_pending(&device()));
        assert_eq!(n.on_result(device(), true), None);
    }

    #[test]
    fn test_register_is_idempotent() {
        let transport = MockTransport::new();
        let mut n = PermissionNegotiator::new(Arc::new(transport.clone()));
        let (tx, _rx) = event::channel();
        n.register(tx.clone()).unwrap();
        n.register(tx).unwrap();
        assert_eq!(transport.permission_listener_count(), 1);
    }
}
