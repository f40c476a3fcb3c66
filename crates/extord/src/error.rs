use thiserror::Error;

/// Errors loading or creating the authentication cookie file.
///
/// All of these are fatal to daemon startup.
#[derive(Error, Debug)]
pub enum CookieError {
    /// The cookie file or its directory could not be read or written.
    #[error("cookie file i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The existing cookie file is not a well-formed cookie file.
    #[error("malformed cookie file: {0}")]
    Format(String),
    /// The existing cookie file is readable by other users.
    #[error("cookie file permissions too open: {0:o}")]
    Permissions(u32),
}

/// Errors from the connection identity map.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// The identifier is already mapped to a live connection.
    #[error("duplicate connection identifier")]
    DuplicateId,
    /// No connection is mapped to the identifier.
    #[error("connection identifier not found")]
    NotFound,
}

/// Per-connection errors. Each one closes only the offending connection.
#[derive(Error, Debug)]
pub enum ExtOrError {
    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Oversized or malformed command.
    #[error("frame error: {0}")]
    Frame(#[from] extor_common::FrameError),
    /// Command not acceptable in the current state, or unsupported auth type.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// The client hash did not match.
    #[error("authentication failed")]
    AuthFailure,
    /// Post-authentication metadata was refused.
    #[error("metadata refused: {0}")]
    Metadata(&'static str),
    /// Identity map rejected the connection identifier.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    /// The exchange did not complete within the handshake timeout.
    #[error("handshake timed out")]
    Timeout,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ExtOrError {
    /// Whether this failure belongs to the authentication handshake and is
    /// reported through the diagnostic rate limiter.
    #[must_use]
    pub const fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::Protocol(_) | Self::AuthFailure)
    }

    /// Short label used for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Frame(_) => "frame",
            Self::Protocol(_) => "protocol",
            Self::AuthFailure => "auth_failure",
            Self::Metadata(_) => "metadata",
            Self::Identity(_) => "identity",
            Self::Timeout => "timeout",
            Self::ConnectionClosed => "closed",
        }
    }
}
