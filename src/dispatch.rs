//! Rate-limited routing of commands to the camera.

use crate::command::{Command, CommandKind};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default spacing between executed commands.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// The camera side of the channel.
///
/// Each action returns whether the camera accepted it. Mode switches are
/// expected to consult [`is_guided_session_active`](Self::is_guided_session_active)
/// themselves; the dispatcher never calls it.
pub trait CommandReceiver: Send {
    fn trigger_capture(&mut self) -> bool;

    fn switch_to_normal_mode(&mut self) -> bool;

    fn switch_to_fluorescence_mode(&mut self) -> bool;

    fn is_guided_session_active(&self) -> bool;
}

/// Result of handing one command to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The receiver performed the action.
    Accepted,
    /// Dropped: the previous attempt was too recent.
    RateLimited { elapsed: Duration },
    /// The receiver declined (camera busy, guided session, ...).
    ReceiverRejected,
    /// The receiver panicked while handling the command.
    ReceiverFailed,
    /// The line did not name a known command.
    UnknownCommand,
}

impl DispatchOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::RateLimited { elapsed } => {
                write!(f, "rate limited ({}ms since last)", elapsed.as_millis())
            }
            Self::ReceiverRejected => write!(f, "rejected by receiver"),
            Self::ReceiverFailed => write!(f, "receiver failed"),
            Self::UnknownCommand => write!(f, "unknown command"),
        }
    }
}

/// Routes commands to a [`CommandReceiver`], enforcing a minimum interval.
///
/// The interval window opens at each dispatch *attempt* that passes the
/// rate check, whether or not the receiver then accepts the command.
pub struct CommandDispatcher {
    receiver: Box<dyn CommandReceiver>,
    min_interval: Duration,
    last_command_at: Option<Instant>,
}

impl CommandDispatcher {
    pub fn new(receiver: Box<dyn CommandReceiver>, min_interval: Duration) -> Self {
        Self {
            receiver,
            min_interval,
            last_command_at: None,
        }
    }

    /// Dispatch `command` using the current time.
    pub fn dispatch(&mut self, command: &Command) -> DispatchOutcome {
        self.dispatch_at(command, Instant::now())
    }

    /// Dispatch `command` as if the current time were `now`.
    pub fn dispatch_at(&mut self, command: &Command, now: Instant) -> DispatchOutcome {
        let kind = command.kind();
        if kind.is_unknown() {
            debug!(raw = command.raw_text(), "Ignoring unknown command");
            return DispatchOutcome::UnknownCommand;
        }

        if let Some(last) = self.last_command_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                debug!(
                    command = %kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Command rate limited"
                );
                return DispatchOutcome::RateLimited { elapsed };
            }
        }

        self.last_command_at = Some(now);
        info!(command = %kind, raw = command.raw_text(), "Dispatching command");

        let receiver = &mut self.receiver;
        let result = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            CommandKind::Capture => receiver.trigger_capture(),
            CommandKind::SwitchFluorescence => receiver.switch_to_fluorescence_mode(),
            CommandKind::SwitchNormal => receiver.switch_to_normal_mode(),
            CommandKind::Unknown => false,
        }));

        match result {
            Ok(true) => {
                debug!(command = %kind, "Command executed");
                DispatchOutcome::Accepted
            }
            Ok(false) => {
                warn!(command = %kind, "Command rejected by receiver");
                DispatchOutcome::ReceiverRejected
            }
            Err(_) => {
                error!(command = %kind, "Receiver panicked while handling command");
                DispatchOutcome::ReceiverFailed
            }
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Time of the last attempt that passed the rate check.
    pub fn last_command_at(&self) -> Option<Instant> {
        self.last_command_at
    }

    /// Forget the last attempt so the next command passes immediately.
    pub fn reset(&mut self) {
        self.last_command_at = None;
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("min_interval", &self.min_interval)
            .field("last_command_at", &self.last_command_at)
            .finish()
    }
}
