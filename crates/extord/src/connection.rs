use crate::auth::{AuthSession, SessionEvent};
use crate::error::{ExtOrError, IdentityError};
use crate::identity::ConnHandle;
use crate::metrics::{counters, gauges, histograms};
use crate::server::{AcceptedConnection, ConnMetadata, ServerState};
use extor_common::types::id_hex;
use extor_common::{ExtOrId, Framer};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 4096;
const DENY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Keeps the active-connection count and gauge in step with the task.
struct ActiveGuard {
    state: Arc<ServerState>,
}

impl ActiveGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Self { state }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// A CONN_ID registration owned by one connection.
///
/// Dropping it removes the identifier from the identity map, unless the
/// entry has since been claimed and re-registered by another connection.
pub struct IdRegistration {
    state: Arc<ServerState>,
    id: ExtOrId,
    serial: u64,
}

impl IdRegistration {
    /// The registered identifier.
    #[must_use]
    pub const fn id(&self) -> &ExtOrId {
        &self.id
    }
}

impl std::fmt::Debug for IdRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdRegistration")
            .field("id", &id_hex(&self.id))
            .field("serial", &self.serial)
            .finish()
    }
}

impl Drop for IdRegistration {
    fn drop(&mut self) {
        let serial = self.serial;
        self.state.ids.remove_if(&self.id, |h| h.serial == serial);
    }
}

/// Per-connection bookkeeping alongside the session.
struct Exchange {
    state: Arc<ServerState>,
    serial: u64,
    peer_addr: SocketAddr,
    authenticated: bool,
    metadata: ConnMetadata,
    registration: Option<IdRegistration>,
}

impl Exchange {
    fn apply(
        &mut self,
        event: SessionEvent,
        session: &mut AuthSession,
        out: &mut Framer,
    ) -> Result<(), ExtOrError> {
        match event {
            SessionEvent::Authenticated => {
                self.authenticated = true;
                counters::auth_total("accepted");
            }
            SessionEvent::ClientAddr(addr) => self.metadata.client_addr = Some(addr),
            SessionEvent::Transport(name) => self.metadata.transport = Some(name),
            SessionEvent::ConnId(id) => {
                if self.registration.is_some() {
                    return Err(session.refuse(out, ExtOrError::Metadata("CONN_ID sent twice")));
                }
                let handle = ConnHandle {
                    serial: self.serial,
                    peer_addr: self.peer_addr,
                    registered_at: Instant::now(),
                };
                if let Err(e) = self.state.ids.register(id, handle) {
                    return Err(session.refuse(out, ExtOrError::Identity(e)));
                }
                tracing::debug!(peer = %self.peer_addr, id = %id_hex(&id), "registered connection identifier");
                self.metadata.ext_or_id = Some(id);
                self.registration = Some(IdRegistration {
                    state: Arc::clone(&self.state),
                    id,
                    serial: self.serial,
                });
            }
            SessionEvent::Done => {}
        }
        Ok(())
    }
}

/// Reads, parses and answers until the session reaches `Flushing`.
async fn run_exchange(
    stream: &mut TcpStream,
    framer: &mut Framer,
    session: &mut AuthSession,
    exchange: &mut Exchange,
) -> Result<(), ExtOrError> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        while !session.is_flushing() {
            let Some(cmd) = framer.try_take_command()? else {
                break;
            };
            if let Some(event) = session.process(&cmd, framer)? {
                exchange.apply(event, session, framer)?;
            }
        }

        if framer.has_pending_output() {
            stream.write_all(&framer.take_output()).await?;
        }
        if session.is_flushing() {
            return Ok(());
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ExtOrError::ConnectionClosed);
        }
        framer.feed(&buf[..n]);
    }
}

/// Serve one Extended ORPort connection until it is handed off or closed.
///
/// # Errors
///
/// Returns the reason the connection was closed. Handshake failures have
/// already been logged through the diagnostic rate limiter.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), ExtOrError> {
    let started = Instant::now();
    let _active = ActiveGuard::new(Arc::clone(&state));
    let serial = state.next_serial();
    let _ = stream.set_nodelay(true);

    let mut framer = Framer::new(state.config.max_body);
    let mut session = AuthSession::new(Arc::clone(&state.cookie));
    let mut exchange = Exchange {
        state: Arc::clone(&state),
        serial,
        peer_addr,
        authenticated: false,
        metadata: ConnMetadata::default(),
        registration: None,
    };

    let outcome = tokio::time::timeout(
        state.config.handshake_timeout(),
        run_exchange(&mut stream, &mut framer, &mut session, &mut exchange),
    )
    .await
    .unwrap_or(Err(ExtOrError::Timeout));

    if let Err(e) = outcome {
        report_failure(&state, &exchange, &e);
        if matches!(e, ExtOrError::Metadata(_) | ExtOrError::Identity(_)) {
            // DENY is the only reply a failed connection ever gets.
            let deny = framer.take_output();
            let _ = tokio::time::timeout(DENY_WRITE_TIMEOUT, stream.write_all(&deny)).await;
        } else {
            framer.discard_output();
        }
        let _ = stream.shutdown().await;
        return Err(e);
    }

    histograms::handshake_seconds(started.elapsed().as_secs_f64());
    tracing::debug!(
        peer = %peer_addr,
        transport = exchange.metadata.transport.as_deref().unwrap_or("-"),
        "extended orport connection ready for handoff"
    );

    let accepted = AcceptedConnection {
        stream,
        leftover: framer.into_remaining(),
        peer_addr,
        serial,
        metadata: std::mem::take(&mut exchange.metadata),
        registration: exchange.registration.take(),
    };
    state.hand_off(accepted).await?;
    counters::handoffs_total();
    Ok(())
}

fn report_failure(state: &ServerState, exchange: &Exchange, err: &ExtOrError) {
    let peer = exchange.peer_addr;
    if !exchange.authenticated {
        match err {
            ExtOrError::Timeout => counters::auth_total("timeout"),
            e if e.is_handshake_failure() => counters::auth_total("rejected"),
            _ => {}
        }
    }

    if err.is_handshake_failure() && !exchange.authenticated {
        if let Some(suffix) = state.rate_limited_failure(Instant::now()) {
            tracing::warn!(
                peer = %peer,
                reason = err.label(),
                "rejected extended orport connection: {}{}",
                err,
                suffix
            );
        }
        return;
    }

    match err {
        ExtOrError::Identity(IdentityError::DuplicateId) => {
            tracing::info!(peer = %peer, "refused duplicate connection identifier");
        }
        _ => tracing::debug!(peer = %peer, reason = err.label(), "extended orport connection failed: {}", err),
    }
}
