//! Extended ORPort gatekeeper: cookie authentication, command framing and
//! connection handoff for pluggable transports.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Handshake and metadata state machine.
pub mod auth;
/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection tokio driver.
pub mod connection;
/// Authentication cookie file.
pub mod cookie;
/// Error types for cookie, identity and connection failures.
pub mod error;
/// Transport-chosen identifier table.
pub mod identity;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
mod ratelimit;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, AcceptedConnection, ConnMetadata, ServerState};
