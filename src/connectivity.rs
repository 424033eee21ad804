//! Connectivity watcher.
//!
//! While at least one channel is open the session subscribes to system
//! connectivity notifications. The watcher holds at most one pending
//! default-bearer wait (an OPEN_CHANNEL deferred because the bearer was
//! still connecting) and resolves it exactly once from the notification
//! stream.

use std::sync::Arc;

use tracing::debug;

use crate::command::BipCommand;
use crate::services::{ConnectivityMonitor, DataCallError, DataCallOutcome};

/// A system connectivity change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    /// Whether connectivity is present after the change.
    pub connected: bool,
    /// When connectivity is absent: whether another network is still
    /// attempting to connect.
    pub other_network_pending: bool,
}

pub(crate) struct ConnectivityWatcher {
    monitor: Arc<dyn ConnectivityMonitor>,
    listening: bool,
    pending: Option<BipCommand>,
}

impl ConnectivityWatcher {
    pub(crate) fn new(monitor: Arc<dyn ConnectivityMonitor>) -> Self {
        Self {
            monitor,
            listening: false,
            pending: None,
        }
    }

    /// Subscribe to connectivity notifications. Idempotent.
    pub(crate) fn start_listening(&mut self) {
        if self.listening {
            return;
        }
        debug!("starting connectivity notifications");
        self.monitor.start_notifications();
        self.listening = true;
    }

    /// Unsubscribe and discard any pending wait. Idempotent.
    pub(crate) fn stop_listening(&mut self) {
        if !self.listening {
            return;
        }
        debug!("stopping connectivity notifications");
        self.monitor.stop_notifications();
        self.pending = None;
        self.listening = false;
    }

    /// Park an OPEN_CHANNEL until the connecting default bearer resolves.
    pub(crate) fn set_pending(&mut self, cmd: BipCommand) {
        self.pending = Some(cmd);
    }

    /// Feed a connectivity notification.
    ///
    /// Returns the parked command and its setup result when this
    /// notification resolves the wait. Resolution is exactly-once: later
    /// notifications find no pending command and are no-ops.
    pub(crate) fn on_change(
        &mut self,
        change: ConnectivityChange,
    ) -> Option<(BipCommand, Result<DataCallOutcome, DataCallError>)> {
        if !self.listening {
            debug!("connectivity change while not listening, ignored");
            return None;
        }
        if change.connected {
            let cmd = self.pending.take()?;
            debug!("default bearer connected");
            Some((cmd, Ok(DataCallOutcome::DefaultBearer)))
        } else if change.other_network_pending {
            // Another network is still trying; keep waiting.
            debug!("still connecting");
            None
        } else {
            let cmd = self.pending.take()?;
            debug!("default bearer failed to connect");
            Some((cmd, Err(DataCallError::new("default bearer failed to connect"))))
        }
    }
}
