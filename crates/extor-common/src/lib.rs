//! Shared wire vocabulary for the Extended ORPort.
//!
//! This crate provides:
//! - Command framing and the incremental [`command::Framer`] ([`command`])
//! - Cookie-authentication hashes and nonces ([`crypto`])
//! - Protocol constants shared by relay and transport ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod crypto;
pub mod types;

pub use command::{Command, CommandType, FrameError, Framer};
pub use types::ExtOrId;
