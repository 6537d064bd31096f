//! Heartbeat configuration errors.

use thiserror::Error;

/// Misuse of the monitor API. None of these are runtime conditions: they
/// mean the owner wired the monitor incorrectly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat monitor started without a probe callback")]
    MissingCallback,

    #[error("heartbeat monitor already started")]
    AlreadyStarted,

    #[error("a heartbeat monitor is already active, new configuration discarded")]
    AlreadyActive,

    #[error("heartbeat monitor must be started from within a tokio runtime")]
    NoRuntime,

    #[error("heartbeat signal interval must be non-zero")]
    InvalidInterval,

    #[error("heartbeat ack timeout must be non-zero")]
    InvalidAckTimeout,
}
