//! Diagnostics HTTP server backed by a heartbeat monitor.
//!
//! A [`Server`] owns a handler table (health, Prometheus metrics, pprof) and a
//! [`HeartbeatSlot`](heartbeat::HeartbeatSlot). [`Server::start`] serves the
//! table and runs the heartbeat until the caller's cancellation token fires or
//! the serving loop dies, then shuts both down in order.

pub mod config;
pub mod endpoints;
pub mod error;
pub mod server;
pub mod shutdown;

pub use error::ServerError;
pub use server::Server;
