//! Per-connection Extended ORPort protocol driver.
//!
//! [`AuthSession`] consumes decoded commands one at a time and queues its
//! replies on the connection's [`Framer`]. It never blocks and performs no
//! I/O: the caller feeds it whatever commands the framer has assembled and
//! flushes the framer's output afterwards.
//!
//! ```text
//! AwaitingAuthType --AUTH_TYPE--> AwaitingClientNonce --CLIENT_NONCE-->
//! AwaitingClientHash --CLIENT_HASH--> Open --DONE--> Flushing
//!        \_____________ any violation _____________/ --> Rejected
//! ```

use crate::cookie::CookieSecret;
use crate::error::ExtOrError;
use extor_common::command::{Command, CommandType, Framer};
use extor_common::crypto;
use extor_common::types::{
    ExtOrId, Nonce, AUTH_TYPE_SAFE_COOKIE, EXT_OR_ID_LEN, HASH_LEN, NONCE_LEN,
    SERVER_CHALLENGE_LEN,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Protocol state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Waiting for the transport to pick an authentication method.
    AwaitingAuthType,
    /// Waiting for the client nonce.
    AwaitingClientNonce,
    /// Challenge sent; waiting for the client hash.
    AwaitingClientHash {
        /// Nonce this relay generated for this connection only.
        server_nonce: Nonce,
        /// Nonce the transport sent.
        client_nonce: Nonce,
    },
    /// Authenticated; metadata commands are accepted.
    Open,
    /// DONE acknowledged; the connection is about to be handed off.
    Flushing,
    /// Terminal. The connection must be closed.
    Rejected,
}

/// Something the connection driver must act on after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake completed and the state is now [`AuthState::Open`].
    Authenticated,
    /// The transport reported the true client address.
    ClientAddr(SocketAddr),
    /// The transport reported its name.
    Transport(String),
    /// The transport chose an identifier for this connection.
    ConnId(ExtOrId),
    /// Metadata is complete; flush output and hand the connection off.
    Done,
}

/// Handshake and metadata state machine for one connection.
#[derive(Debug)]
pub struct AuthSession {
    cookie: Arc<CookieSecret>,
    state: AuthState,
}

impl AuthSession {
    /// Starts a session in [`AuthState::AwaitingAuthType`].
    #[must_use]
    pub fn new(cookie: Arc<CookieSecret>) -> Self {
        Self {
            cookie,
            state: AuthState::AwaitingAuthType,
        }
    }

    /// Current protocol state.
    #[must_use]
    pub const fn state(&self) -> &AuthState {
        &self.state
    }

    /// Returns `true` once authentication has succeeded and DONE has not
    /// yet been received.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, AuthState::Open)
    }

    /// Returns `true` once DONE has been acknowledged.
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        matches!(self.state, AuthState::Flushing)
    }

    /// Returns `true` once the session has failed.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self.state, AuthState::Rejected)
    }

    /// Advances the session by one command, queueing any reply on `out`.
    ///
    /// # Errors
    ///
    /// Any error moves the session to [`AuthState::Rejected`]:
    /// - [`ExtOrError::Protocol`] for a command the current state does not
    ///   accept, a wrong body length, or an unsupported auth type;
    /// - [`ExtOrError::AuthFailure`] if the client hash does not match;
    /// - [`ExtOrError::Metadata`] for refused metadata, after queueing DENY.
    pub fn process(
        &mut self,
        cmd: &Command,
        out: &mut Framer,
    ) -> Result<Option<SessionEvent>, ExtOrError> {
        let result = self.step(cmd, out);
        if result.is_err() && !self.is_rejected() {
            self.state = AuthState::Rejected;
        }
        result
    }

    /// Queues DENY and rejects the session.
    ///
    /// Used when the driver refuses metadata the session accepted, such as a
    /// connection identifier already in use.
    pub fn refuse(&mut self, out: &mut Framer, err: ExtOrError) -> ExtOrError {
        if out.write_command(CommandType::Deny, &[]).is_err() {
            out.discard_output();
        }
        self.state = AuthState::Rejected;
        err
    }

    fn step(&mut self, cmd: &Command, out: &mut Framer) -> Result<Option<SessionEvent>, ExtOrError> {
        // Take the state so the nonces are dropped on every path out.
        match std::mem::replace(&mut self.state, AuthState::Rejected) {
            AuthState::AwaitingAuthType => {
                expect(cmd, CommandType::AuthType, 1)?;
                if cmd.body[0] != AUTH_TYPE_SAFE_COOKIE {
                    return Err(ExtOrError::Protocol("unsupported authentication type"));
                }
                self.state = AuthState::AwaitingClientNonce;
                Ok(None)
            }
            AuthState::AwaitingClientNonce => {
                expect(cmd, CommandType::ClientNonce, NONCE_LEN)?;
                let mut client_nonce = Nonce::default();
                client_nonce.copy_from_slice(&cmd.body);
                let server_nonce = crypto::random_nonce();
                let server_hash =
                    crypto::server_hash(self.cookie.as_bytes(), &server_nonce, &client_nonce);

                let mut reply = [0u8; SERVER_CHALLENGE_LEN];
                reply[..NONCE_LEN].copy_from_slice(&server_nonce);
                reply[NONCE_LEN..].copy_from_slice(&server_hash);
                out.write_command(CommandType::ServerChallenge, &reply)?;

                self.state = AuthState::AwaitingClientHash {
                    server_nonce,
                    client_nonce,
                };
                Ok(None)
            }
            AuthState::AwaitingClientHash {
                server_nonce,
                client_nonce,
            } => {
                expect(cmd, CommandType::ClientHash, HASH_LEN)?;
                let expected =
                    crypto::client_hash(self.cookie.as_bytes(), &server_nonce, &client_nonce);
                if !crypto::hashes_match(&expected, &cmd.body) {
                    return Err(ExtOrError::AuthFailure);
                }
                out.write_command(CommandType::AuthOk, &[])?;
                self.state = AuthState::Open;
                tracing::debug!("extended orport authentication succeeded");
                Ok(Some(SessionEvent::Authenticated))
            }
            AuthState::Open => {
                self.state = AuthState::Open;
                self.open_command(cmd, out)
            }
            AuthState::Flushing => Err(ExtOrError::Protocol("command received while flushing")),
            AuthState::Rejected => Err(ExtOrError::Protocol("session already rejected")),
        }
    }

    fn open_command(
        &mut self,
        cmd: &Command,
        out: &mut Framer,
    ) -> Result<Option<SessionEvent>, ExtOrError> {
        match cmd.kind {
            CommandType::Done => {
                out.write_command(CommandType::Okay, &[])?;
                self.state = AuthState::Flushing;
                Ok(Some(SessionEvent::Done))
            }
            CommandType::UserAddr => match parse_user_addr(&cmd.body) {
                Some(addr) => Ok(Some(SessionEvent::ClientAddr(addr))),
                None => Err(self.refuse(out, ExtOrError::Metadata("unparseable USERADDR"))),
            },
            CommandType::Transport => match parse_transport(&cmd.body) {
                Some(name) => Ok(Some(SessionEvent::Transport(name))),
                None => Err(self.refuse(out, ExtOrError::Metadata("invalid TRANSPORT name"))),
            },
            CommandType::ConnId => {
                let Ok(id) = ExtOrId::try_from(cmd.body.as_slice()) else {
                    return Err(self.refuse(out, ExtOrError::Metadata("bad CONN_ID length")));
                };
                Ok(Some(SessionEvent::ConnId(id)))
            }
            kind if kind.is_handshake() => {
                Err(ExtOrError::Protocol("handshake command after authentication"))
            }
            kind => {
                tracing::debug!(
                    command = kind.wire(),
                    "ignoring unrecognized extended orport command"
                );
                Ok(None)
            }
        }
    }
}

fn expect(cmd: &Command, kind: CommandType, len: usize) -> Result<(), ExtOrError> {
    if cmd.kind != kind {
        return Err(ExtOrError::Protocol("unexpected command for handshake state"));
    }
    if cmd.body.len() != len {
        return Err(ExtOrError::Protocol("wrong body length for handshake command"));
    }
    Ok(())
}

/// Parses `addr:port`, with IPv6 addresses in brackets.
fn parse_user_addr(body: &[u8]) -> Option<SocketAddr> {
    std::str::from_utf8(body).ok()?.parse().ok()
}

/// Accepts a non-empty C identifier: `[A-Za-z_][A-Za-z0-9_]*`.
fn parse_transport(body: &[u8]) -> Option<String> {
    let (first, rest) = body.split_first()?;
    let valid = (first.is_ascii_alphabetic() || *first == b'_')
        && rest.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_');
    valid.then(|| String::from_utf8_lossy(body).into_owned())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_command() -> impl Strategy<Value = Command> {
        (
            any::<u16>(),
            proptest::collection::vec(any::<u8>(), 0..64),
        )
            .prop_map(|(kind, body)| Command::new(CommandType::from_wire(kind), &body))
    }

    proptest! {
        /// Without the cookie no command sequence reaches `Open`, and the
        /// only reply ever sent before authentication is the challenge.
        #[test]
        fn guessing_never_authenticates(cmds in proptest::collection::vec(arb_command(), 1..8)) {
            let mut s = AuthSession::new(Arc::new(CookieSecret::from_bytes([0x5A; 32])));
            let mut out = Framer::default();
            for c in &cmds {
                if s.process(c, &mut out).is_err() {
                    break;
                }
            }
            prop_assert!(!s.is_open());
            prop_assert!(!s.is_flushing());

            let mut reader = Framer::new(1024);
            reader.feed(&out.take_output());
            while let Some(reply) = reader.try_take_command().unwrap() {
                prop_assert_eq!(reply.kind, CommandType::ServerChallenge);
            }
        }
    }
}
