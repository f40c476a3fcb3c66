//! Core type definitions and protocol constants for the Extended ORPort.
//!
//! These values are compatibility-critical: the pluggable transport and the
//! relay must agree on every one of them byte for byte.

/// Length of the shared authentication cookie in bytes.
pub const COOKIE_LEN: usize = 32;

/// Length of the client and server nonces in bytes.
pub const NONCE_LEN: usize = 16;

/// Length of an authentication hash (HMAC-SHA256 output) in bytes.
pub const HASH_LEN: usize = 32;

/// Length of the opaque connection identifier chosen by the transport.
pub const EXT_OR_ID_LEN: usize = 20;

/// Body length of a SERVER_CHALLENGE command: `server_nonce ‖ server_hash`.
pub const SERVER_CHALLENGE_LEN: usize = NONCE_LEN + HASH_LEN;

/// The only supported authentication method: shared cookie with nonce challenge.
pub const AUTH_TYPE_SAFE_COOKIE: u8 = 0x01;

/// HMAC label for the hash the relay proves itself with.
pub const SERVER_HASH_LABEL: &[u8] = b"ExtORPort authentication server-to-client hash";

/// HMAC label for the hash the transport proves itself with.
pub const CLIENT_HASH_LABEL: &[u8] = b"ExtORPort authentication client-to-server hash";

/// Fixed header written in front of the cookie in the cookie file.
pub const COOKIE_FILE_HEADER: &[u8; 32] = b"! Extended ORPort Auth Cookie !\x0a";

/// Total size of a well-formed cookie file.
pub const COOKIE_FILE_LEN: usize = COOKIE_FILE_HEADER.len() + COOKIE_LEN;

/// Opaque identifier a transport attaches to a connection.
pub type ExtOrId = [u8; EXT_OR_ID_LEN];

/// A client or server nonce.
pub type Nonce = [u8; NONCE_LEN];

/// An authentication hash.
pub type AuthHash = [u8; HASH_LEN];

/// Render an identifier as lowercase hex for log lines.
#[must_use]
pub fn id_hex(id: &ExtOrId) -> String {
    use std::fmt::Write;
    id.iter().fold(String::with_capacity(EXT_OR_ID_LEN * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
