//! Process liveness watchdog.
//!
//! A [`HeartbeatMonitor`] periodically invokes a probe and expects it to
//! return within an acknowledgment window. Its verdict is readable from any
//! task without blocking. A [`HeartbeatSlot`] is the owner-held cell through
//! which the active monitor is published to readers such as a health
//! endpoint.
//!
//! Monitors are scoped to a [`CancellationToken`](tokio_util::sync::CancellationToken):
//! cancelling the token passed at initialization, or any of its ancestors,
//! stops the ticking loop and freezes the verdict.

mod error;
mod metrics;
mod monitor;
mod slot;

pub use error::HeartbeatError;
pub use monitor::{HeartbeatMonitor, MonitorState, ProbeCallback};
pub use slot::HeartbeatSlot;
