//! Extended ORPort command framing.
//!
//! Every message on the wire is a command:
//!
//! ```text
//! | type: u16 BE | length: u16 BE | body: length bytes |
//! ```
//!
//! [`Framer`] accumulates arbitrarily chunked input into whole commands and
//! serializes outgoing commands into a buffer the caller flushes. It never
//! blocks and never performs I/O.

use thiserror::Error;

/// Size of the fixed command header.
pub const HEADER_LEN: usize = 4;

/// Largest body the 16-bit length field can describe.
pub const MAX_WIRE_BODY: usize = u16::MAX as usize;

/// Default maximum body length accepted by a [`Framer`].
pub const DEFAULT_MAX_BODY: usize = 1024;

/// DONE: transport → relay, metadata finished.
pub const TYPE_DONE: u16 = 0x0000;
/// USERADDR: transport → relay, true client address as `addr:port`.
pub const TYPE_USERADDR: u16 = 0x0001;
/// TRANSPORT: transport → relay, name of the pluggable transport.
pub const TYPE_TRANSPORT: u16 = 0x0002;
/// CONN_ID: transport → relay, opaque identifier for this connection.
pub const TYPE_CONN_ID: u16 = 0x0003;
/// AUTH_TYPE: transport → relay, selected authentication method.
pub const TYPE_AUTH_TYPE: u16 = 0x0100;
/// CLIENT_NONCE: transport → relay, client nonce.
pub const TYPE_CLIENT_NONCE: u16 = 0x0101;
/// CLIENT_HASH: transport → relay, client proof of cookie knowledge.
pub const TYPE_CLIENT_HASH: u16 = 0x0102;
/// OKAY: relay → transport, DONE acknowledged.
pub const TYPE_OKAY: u16 = 0x1000;
/// DENY: relay → transport, metadata refused.
pub const TYPE_DENY: u16 = 0x1001;
/// SERVER_CHALLENGE: relay → transport, server nonce and server hash.
pub const TYPE_SERVER_CHALLENGE: u16 = 0x1100;
/// AUTH_OK: relay → transport, authentication succeeded.
pub const TYPE_AUTH_OK: u16 = 0x1101;

/// Command type, mapped 1:1 from the `TYPE_*` wire values.
///
/// Unrecognized values are preserved in [`CommandType::Unknown`] so the
/// session layer can decide whether to ignore or reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Metadata finished.
    Done,
    /// True client address.
    UserAddr,
    /// Transport name.
    Transport,
    /// Connection identifier.
    ConnId,
    /// Authentication method selection.
    AuthType,
    /// Client nonce.
    ClientNonce,
    /// Client hash.
    ClientHash,
    /// DONE acknowledged.
    Okay,
    /// Metadata refused.
    Deny,
    /// Server nonce and hash.
    ServerChallenge,
    /// Authentication succeeded.
    AuthOk,
    /// Any other wire value.
    Unknown(u16),
}

impl CommandType {
    /// Maps a wire value to a command type.
    #[must_use]
    pub const fn from_wire(value: u16) -> Self {
        match value {
            TYPE_DONE => Self::Done,
            TYPE_USERADDR => Self::UserAddr,
            TYPE_TRANSPORT => Self::Transport,
            TYPE_CONN_ID => Self::ConnId,
            TYPE_AUTH_TYPE => Self::AuthType,
            TYPE_CLIENT_NONCE => Self::ClientNonce,
            TYPE_CLIENT_HASH => Self::ClientHash,
            TYPE_OKAY => Self::Okay,
            TYPE_DENY => Self::Deny,
            TYPE_SERVER_CHALLENGE => Self::ServerChallenge,
            TYPE_AUTH_OK => Self::AuthOk,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire value for this command type.
    #[must_use]
    pub const fn wire(self) -> u16 {
        match self {
            Self::Done => TYPE_DONE,
            Self::UserAddr => TYPE_USERADDR,
            Self::Transport => TYPE_TRANSPORT,
            Self::ConnId => TYPE_CONN_ID,
            Self::AuthType => TYPE_AUTH_TYPE,
            Self::ClientNonce => TYPE_CLIENT_NONCE,
            Self::ClientHash => TYPE_CLIENT_HASH,
            Self::Okay => TYPE_OKAY,
            Self::Deny => TYPE_DENY,
            Self::ServerChallenge => TYPE_SERVER_CHALLENGE,
            Self::AuthOk => TYPE_AUTH_OK,
            Self::Unknown(v) => v,
        }
    }

    /// Returns `true` for the commands that belong to the authentication
    /// handshake, in either direction.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::AuthType
                | Self::ClientNonce
                | Self::ClientHash
                | Self::ServerChallenge
                | Self::AuthOk
        )
    }
}

/// A fully assembled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command type.
    pub kind: CommandType,
    /// Command body.
    pub body: Vec<u8>,
}

impl Command {
    /// Creates a command from a type and body.
    #[must_use]
    pub fn new(kind: CommandType, body: &[u8]) -> Self {
        Self {
            kind,
            body: body.to_vec(),
        }
    }

    /// Serializes this command into a standalone byte vector.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the body cannot be described
    /// by the 16-bit length field.
    ///
    /// # Examples
    ///
    /// ```
    /// use extor_common::command::{Command, CommandType};
    /// let bytes = Command::new(CommandType::Okay, &[]).serialize().unwrap();
    /// assert_eq!(bytes, [0x10, 0x00, 0x00, 0x00]);
    /// ```
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let mut v = Vec::with_capacity(HEADER_LEN + self.body.len());
        encode_into(&mut v, self.kind, &self.body)?;
        Ok(v)
    }
}

/// Errors that can occur while framing commands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A declared or supplied body exceeds the allowed maximum.
    #[error("command body too large: max {max}, got {actual}")]
    BodyTooLarge {
        /// Maximum allowed body length.
        max: usize,
        /// Length that was declared or supplied.
        actual: usize,
    },
}

fn encode_into(out: &mut Vec<u8>, kind: CommandType, body: &[u8]) -> Result<(), FrameError> {
    let len = u16::try_from(body.len()).map_err(|_| FrameError::BodyTooLarge {
        max: MAX_WIRE_BODY,
        actual: body.len(),
    })?;
    out.extend_from_slice(&kind.wire().to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(())
}

/// Incremental command reader and writer for one connection.
#[derive(Debug)]
pub struct Framer {
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    max_body: usize,
}

impl Framer {
    /// Creates a framer that refuses bodies longer than `max_body`.
    ///
    /// `max_body` is clamped to [`MAX_WIRE_BODY`].
    #[must_use]
    pub fn new(max_body: usize) -> Self {
        Self {
            inbuf: Vec::with_capacity(HEADER_LEN + 64),
            outbuf: Vec::new(),
            max_body: max_body.min(MAX_WIRE_BODY),
        }
    }

    /// Maximum accepted body length.
    #[must_use]
    pub const fn max_body(&self) -> usize {
        self.max_body
    }

    /// Appends raw bytes received from the peer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbuf.extend_from_slice(bytes);
    }

    /// Number of input bytes buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inbuf.len()
    }

    /// Takes the next complete command out of the input buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The declared length is
    /// checked as soon as the header is complete, so an oversized command is
    /// refused before any of its body is waited for.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the header declares a body
    /// longer than this framer's maximum.
    ///
    /// # Examples
    ///
    /// ```
    /// use extor_common::command::{CommandType, Framer};
    /// let mut framer = Framer::new(1024);
    /// framer.feed(&[0x00, 0x02, 0x00, 0x04, b'o']);
    /// assert!(framer.try_take_command().unwrap().is_none());
    /// framer.feed(b"bfs");
    /// let cmd = framer.try_take_command().unwrap().unwrap();
    /// assert_eq!(cmd.kind, CommandType::Transport);
    /// assert_eq!(cmd.body, b"obfs");
    /// ```
    pub fn try_take_command(&mut self) -> Result<Option<Command>, FrameError> {
        if self.inbuf.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = CommandType::from_wire(u16::from_be_bytes([self.inbuf[0], self.inbuf[1]]));
        let len = usize::from(u16::from_be_bytes([self.inbuf[2], self.inbuf[3]]));
        if len > self.max_body {
            return Err(FrameError::BodyTooLarge {
                max: self.max_body,
                actual: len,
            });
        }
        let total = HEADER_LEN + len;
        if self.inbuf.len() < total {
            return Ok(None);
        }
        let body = self.inbuf[HEADER_LEN..total].to_vec();
        self.inbuf.drain(..total);
        Ok(Some(Command { kind, body }))
    }

    /// Serializes a command onto the outgoing buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if `body` cannot be described by
    /// the 16-bit length field. Nothing is queued in that case.
    pub fn write_command(&mut self, kind: CommandType, body: &[u8]) -> Result<(), FrameError> {
        encode_into(&mut self.outbuf, kind, body)
    }

    /// Returns `true` if there are queued bytes waiting to be flushed.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Drains the outgoing buffer.
    #[must_use]
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbuf)
    }

    /// Drops any queued output without sending it.
    pub fn discard_output(&mut self) {
        self.outbuf.clear();
    }

    /// Consumes the framer, returning input bytes that were never parsed.
    #[must_use]
    pub fn into_remaining(self) -> Vec<u8> {
        self.inbuf
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let bytes = Command::new(CommandType::ClientNonce, &[0xAA; 3])
            .serialize()
            .unwrap();
        assert_eq!(&bytes[..4], &[0x01, 0x01, 0x00, 0x03]);
        assert_eq!(&bytes[4..], &[0xAA; 3]);
    }

    #[test]
    fn partial_header_needs_more() {
        let mut framer = Framer::default();
        framer.feed(&[0x01, 0x00, 0x00]);
        assert_eq!(framer.try_take_command(), Ok(None));
        assert_eq!(framer.buffered(), 3);
    }

    #[test]
    fn partial_body_needs_more() {
        let mut framer = Framer::default();
        framer.feed(&[0x01, 0x00, 0x00, 0x01]);
        assert_eq!(framer.try_take_command(), Ok(None));
        framer.feed(&[0x01]);
        let cmd = framer.try_take_command().unwrap().unwrap();
        assert_eq!(cmd.kind, CommandType::AuthType);
        assert_eq!(cmd.body, vec![0x01]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn consumes_exactly_one_command() {
        let mut framer = Framer::default();
        let mut bytes = Command::new(CommandType::Done, &[]).serialize().unwrap();
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        framer.feed(&bytes);
        let cmd = framer.try_take_command().unwrap().unwrap();
        assert_eq!(cmd.kind, CommandType::Done);
        assert!(cmd.body.is_empty());
        assert_eq!(framer.into_remaining(), vec![0xDE, 0xAD]);
    }

    #[test]
    fn two_commands_in_one_feed() {
        let mut framer = Framer::default();
        let mut bytes = Command::new(CommandType::Transport, b"obfs4")
            .serialize()
            .unwrap();
        bytes.extend(Command::new(CommandType::Done, &[]).serialize().unwrap());
        framer.feed(&bytes);
        assert_eq!(
            framer.try_take_command().unwrap().unwrap().kind,
            CommandType::Transport
        );
        assert_eq!(
            framer.try_take_command().unwrap().unwrap().kind,
            CommandType::Done
        );
        assert_eq!(framer.try_take_command(), Ok(None));
    }

    #[test]
    fn oversized_declared_length_is_refused_from_header_alone() {
        let mut framer = Framer::new(64);
        framer.feed(&[0x00, 0x01, 0xFF, 0xFF]);
        assert_eq!(
            framer.try_take_command(),
            Err(FrameError::BodyTooLarge {
                max: 64,
                actual: 65_535
            })
        );
        // Nothing beyond the header was ever buffered.
        assert_eq!(framer.buffered(), HEADER_LEN);
    }

    #[test]
    fn body_at_limit_is_accepted() {
        let mut framer = Framer::new(8);
        framer.feed(&Command::new(CommandType::UserAddr, &[b'x'; 8]).serialize().unwrap());
        assert!(framer.try_take_command().unwrap().is_some());
    }

    #[test]
    fn max_body_is_clamped_to_wire_limit() {
        assert_eq!(Framer::new(usize::MAX).max_body(), MAX_WIRE_BODY);
    }

    #[test]
    fn write_command_queues_output() {
        let mut framer = Framer::default();
        assert!(!framer.has_pending_output());
        framer.write_command(CommandType::Okay, &[]).unwrap();
        framer.write_command(CommandType::AuthOk, &[]).unwrap();
        assert!(framer.has_pending_output());
        let out = framer.take_output();
        assert_eq!(out, vec![0x10, 0x00, 0x00, 0x00, 0x11, 0x01, 0x00, 0x00]);
        assert!(!framer.has_pending_output());
    }

    #[test]
    fn write_command_refuses_unencodable_body() {
        let mut framer = Framer::default();
        let body = vec![0u8; MAX_WIRE_BODY + 1];
        assert!(matches!(
            framer.write_command(CommandType::Deny, &body),
            Err(FrameError::BodyTooLarge { .. })
        ));
        assert!(!framer.has_pending_output());
    }

    #[test]
    fn discard_output_drops_queued_bytes() {
        let mut framer = Framer::default();
        framer.write_command(CommandType::Deny, &[]).unwrap();
        framer.discard_output();
        assert!(framer.take_output().is_empty());
    }

    #[test]
    fn unknown_type_is_preserved() {
        let mut framer = Framer::default();
        framer.feed(&[0x7F, 0x7F, 0x00, 0x00]);
        let cmd = framer.try_take_command().unwrap().unwrap();
        assert_eq!(cmd.kind, CommandType::Unknown(0x7F7F));
        assert_eq!(cmd.kind.wire(), 0x7F7F);
    }

    #[test]
    fn all_known_types_map_back_to_wire_value() {
        for v in [
            TYPE_DONE,
            TYPE_USERADDR,
            TYPE_TRANSPORT,
            TYPE_CONN_ID,
            TYPE_AUTH_TYPE,
            TYPE_CLIENT_NONCE,
            TYPE_CLIENT_HASH,
            TYPE_OKAY,
            TYPE_DENY,
            TYPE_SERVER_CHALLENGE,
            TYPE_AUTH_OK,
        ] {
            let kind = CommandType::from_wire(v);
            assert!(!matches!(kind, CommandType::Unknown(_)), "{v:#06x}");
            assert_eq!(kind.wire(), v);
        }
    }

    #[test]
    fn handshake_classification() {
        assert!(CommandType::AuthType.is_handshake());
        assert!(CommandType::ServerChallenge.is_handshake());
        assert!(!CommandType::Done.is_handshake());
        assert!(!CommandType::Unknown(0x0100 + 0x50).is_handshake());
    }
}
