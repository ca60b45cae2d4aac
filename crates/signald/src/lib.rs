//! signald: rendezvous and relay broker for pairs of WebSocket peers.
//!
//! One peer listens on a handle, another connects to it, and the broker
//! relays a bounded number of messages between them within a bounded time.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for broker operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Origin header policy for handshakes.
pub mod origin;
/// Listen/connect pairing.
pub mod pairing;
/// Pending-handle table.
pub mod registry;
/// Bidirectional relay sessions.
pub mod relay;
/// Accept loop and shared server state.
pub mod server;
/// Periodic eviction of expired listeners.
pub mod sweeper;

pub use server::{run, run_with_shutdown, ServerState};
