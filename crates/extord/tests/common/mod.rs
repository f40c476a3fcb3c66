#![allow(dead_code)]

use extor_common::command::MAX_WIRE_BODY;
use extor_common::crypto;
use extor_common::types::{Nonce, AUTH_TYPE_SAFE_COOKIE, NONCE_LEN};
use extor_common::{Command, CommandType, Framer};
use extord::config::ServerConfig;
use extord::cookie::CookieSecret;
use extord::{run, AcceptedConnection, ServerState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const ZERO_COOKIE: [u8; 32] = [0u8; 32];

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        cookie_file: PathBuf::from("unused"),
        cookie_group_readable: false,
        max_conns: 100,
        max_body: 1024,
        handshake_timeout: 5,
        log_rate_interval: 300,
    }
}

pub async fn start_server() -> (
    SocketAddr,
    Arc<ServerState>,
    mpsc::Receiver<AcceptedConnection>,
) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (
    SocketAddr,
    Arc<ServerState>,
    mpsc::Receiver<AcceptedConnection>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);

    let (tx, rx) = mpsc::channel(16);
    let state = Arc::new(ServerState::new(
        config,
        CookieSecret::from_bytes(ZERO_COOKIE),
        tx,
    ));
    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = run(listener, server_state).await;
    });
    (addr, state, rx)
}

/// Plays the pluggable-transport side of the protocol.
pub struct TestTransport {
    pub stream: TcpStream,
    reader: Framer,
}

impl TestTransport {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            reader: Framer::new(MAX_WIRE_BODY),
        }
    }

    pub async fn send(&mut self, kind: CommandType, body: &[u8]) {
        let bytes = Command::new(kind, body).serialize().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next command from the relay, or `None` once the relay closes.
    pub async fn recv_command(&mut self) -> Option<Command> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(cmd) = self.reader.try_take_command().unwrap() {
                return Some(cmd);
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timeout waiting for command")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.reader.feed(&buf[..n]);
        }
    }

    pub async fn expect_command(&mut self, kind: CommandType) -> Command {
        let cmd = self
            .recv_command()
            .await
            .unwrap_or_else(|| panic!("connection closed while waiting for {kind:?}"));
        assert_eq!(cmd.kind, kind, "unexpected reply {cmd:?}");
        cmd
    }

    /// Asserts the relay closes the connection without sending anything.
    pub async fn expect_silent_close(&mut self) {
        if let Some(cmd) = self.recv_command().await {
            panic!("expected silent close, got {cmd:?}");
        }
        assert_eq!(self.reader.buffered(), 0, "partial reply before close");
    }

    /// Sends AUTH_TYPE and CLIENT_NONCE; returns the server nonce after
    /// checking the server hash.
    pub async fn start_handshake(&mut self, cookie: &[u8; 32], client_nonce: &Nonce) -> Nonce {
        self.send(CommandType::AuthType, &[AUTH_TYPE_SAFE_COOKIE]).await;
        self.send(CommandType::ClientNonce, client_nonce).await;

        let challenge = self.expect_command(CommandType::ServerChallenge).await;
        let mut server_nonce = Nonce::default();
        server_nonce.copy_from_slice(&challenge.body[..NONCE_LEN]);
        let expected = crypto::server_hash(cookie, &server_nonce, client_nonce);
        assert!(
            crypto::hashes_match(&expected, &challenge.body[NONCE_LEN..]),
            "relay failed to prove cookie knowledge"
        );
        server_nonce
    }

    /// Runs the full handshake with the test cookie and waits for AUTH_OK.
    pub async fn authenticate(&mut self) {
        let client_nonce = crypto::random_nonce();
        let server_nonce = self.start_handshake(&ZERO_COOKIE, &client_nonce).await;
        let hash = crypto::client_hash(&ZERO_COOKIE, &server_nonce, &client_nonce);
        self.send(CommandType::ClientHash, &hash).await;
        self.expect_command(CommandType::AuthOk).await;
    }

    pub async fn connect_authenticated(addr: &SocketAddr) -> Self {
        let mut transport = Self::connect(addr).await;
        transport.authenticate().await;
        transport
    }
}

pub async fn recv_handoff(rx: &mut mpsc::Receiver<AcceptedConnection>) -> AcceptedConnection {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for handoff")
        .expect("handoff channel closed")
}

/// Polls `cond` until it holds or a second passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
