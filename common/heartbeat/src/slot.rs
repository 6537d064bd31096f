//! Owner-held cell publishing the active monitor to readers on other tasks.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::HeartbeatError;
use crate::monitor::{validate_timing, HeartbeatMonitor};

/// Holds at most one active [`HeartbeatMonitor`].
///
/// The owner calls [`init`](Self::init); readers (e.g. a health handler) get
/// a clone of the slot and only ever see the current instance through
/// [`get_instance`](Self::get_instance) or [`is_alive`](Self::is_alive). An
/// absent monitor reads as not alive.
#[derive(Clone, Default, Debug)]
pub struct HeartbeatSlot {
    current: Arc<RwLock<Option<HeartbeatMonitor>>>,
}

impl HeartbeatSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor scoped to a child of `parent` and publish it.
    ///
    /// While the published monitor's scope is still live, the prior instance
    /// stays in place and the new configuration is discarded.
    pub fn init(
        &self,
        parent: &CancellationToken,
        signal_interval: Duration,
        ack_timeout: Duration,
    ) -> Result<HeartbeatMonitor, HeartbeatError> {
        validate_timing(signal_interval, ack_timeout)?;

        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if current.as_ref().is_some_and(HeartbeatMonitor::is_active) {
            warn!("Heartbeat: monitor already active, keeping the existing instance");
            return Err(HeartbeatError::AlreadyActive);
        }

        let monitor = HeartbeatMonitor::new(parent, signal_interval, ack_timeout);
        debug!(monitor = ?monitor, "Heartbeat: monitor initialized");
        *current = Some(monitor.clone());
        Ok(monitor)
    }

    /// The published monitor, `None` if [`init`](Self::init) never succeeded.
    pub fn get_instance(&self) -> Option<HeartbeatMonitor> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_alive(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(HeartbeatMonitor::is_alive)
    }
}
