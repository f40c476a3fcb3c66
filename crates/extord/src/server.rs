use crate::config::ServerConfig;
use crate::connection::{handle_connection, IdRegistration};
use crate::cookie::CookieSecret;
use crate::error::{ExtOrError, IdentityError};
use crate::identity::{ConnHandle, IdentityMap};
use crate::ratelimit::LogRateLimiter;
use extor_common::ExtOrId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Metadata the transport attached to a connection before DONE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnMetadata {
    /// True client address reported by USERADDR.
    pub client_addr: Option<SocketAddr>,
    /// Transport name reported by TRANSPORT.
    pub transport: Option<String>,
    /// Identifier registered by CONN_ID.
    pub ext_or_id: Option<ExtOrId>,
}

/// An authenticated connection handed to the relay's OR pipeline.
#[derive(Debug)]
pub struct AcceptedConnection {
    /// The socket, positioned right after the OKAY reply.
    pub stream: TcpStream,
    /// Bytes read past DONE; they belong to the OR protocol.
    pub leftover: Vec<u8>,
    /// Address of the transport process's socket.
    pub peer_addr: SocketAddr,
    /// Connection serial, matching the identity map handle.
    pub serial: u64,
    /// Metadata reported by the transport.
    pub metadata: ConnMetadata,
    /// Identity map entry for the CONN_ID, if one was sent. Dropping the
    /// connection without claiming the entry removes it.
    pub registration: Option<IdRegistration>,
}

/// Shared state for the Extended ORPort listener.
///
/// One instance per process, handed to every connection task.
pub struct ServerState {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Authentication cookie. Read-only after startup.
    pub cookie: Arc<CookieSecret>,
    /// Transport-chosen identifier → live connection.
    pub ids: IdentityMap<ConnHandle>,
    /// Limits authentication-failure log lines.
    pub failure_log: Mutex<LogRateLimiter>,
    /// Number of connections currently being served.
    pub active_connections: AtomicUsize,
    next_serial: AtomicU64,
    handoff: mpsc::Sender<AcceptedConnection>,
}

impl ServerState {
    /// Builds server state around a loaded cookie.
    ///
    /// Authenticated connections are sent on `handoff` once they finish
    /// flushing.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        cookie: CookieSecret,
        handoff: mpsc::Sender<AcceptedConnection>,
    ) -> Self {
        let failure_log = Mutex::new(LogRateLimiter::new(config.log_rate_interval()));
        Self {
            config,
            cookie: Arc::new(cookie),
            ids: IdentityMap::new(),
            failure_log,
            active_connections: AtomicUsize::new(0),
            next_serial: AtomicU64::new(1),
            handoff,
        }
    }

    /// Allocates the next connection serial.
    pub fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims the connection registered under `id`, removing the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] if nothing is registered under `id`.
    pub fn lookup_by_ext_or_id(&self, id: &ExtOrId) -> Result<ConnHandle, IdentityError> {
        self.ids.claim(id)
    }

    /// Reports a failure through the diagnostic rate limiter.
    ///
    /// Returns `Some(suffix)` when the caller should log, `None` when the
    /// line is suppressed.
    pub fn rate_limited_failure(&self, now: Instant) -> Option<String> {
        self.failure_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(now)
    }

    pub(crate) async fn hand_off(&self, conn: AcceptedConnection) -> Result<(), ExtOrError> {
        self.handoff
            .send(conn)
            .await
            .map_err(|_| ExtOrError::ConnectionClosed)
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ExtOrError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// When the sender behind `shutdown_rx` sends or is dropped, the loop stops
/// accepting new connections and waits up to 30 seconds for in-flight ones
/// to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), ExtOrError> {
    let local_addr = listener.local_addr().map_err(ExtOrError::Io)?;
    info!("extended orport listening on {}", local_addr);
    if !local_addr.ip().is_loopback() {
        warn!("extended orport is bound to a non-loopback address");
    }
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("extended orport connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    let drain_timeout = std::time::Duration::from_secs(30);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    state.ids.clear();
    info!("extended orport shut down");
    Ok(())
}
