#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use extor_common::types::id_hex;
use extord::config::{Args, ServerConfig};
use extord::cookie;
use extord::metrics::{start_metrics_server, HealthState};
use extord::{run_with_shutdown, AcceptedConnection, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Authenticated connections waiting for the OR pipeline.
const HANDOFF_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config: ServerConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    // The cookie must exist before the transport is told where to connect.
    let secret = cookie::load_or_create(&config.cookie_file, config.cookie_group_readable)
        .with_context(|| format!("loading cookie file {}", config.cookie_file.display()))?;

    let (handoff_tx, handoff_rx) = mpsc::channel(HANDOFF_QUEUE);
    let state = Arc::new(ServerState::new(config.clone(), secret, handoff_tx));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::spawn(consume_handoffs(handoff_rx, Arc::clone(&state)));
    health_state.set_ready(true);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    let _ = shutdown_tx.send(());

    if let Err(e) = server.await? {
        tracing::error!("server error: {}", e);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Takes ownership of authenticated connections.
///
/// Stands in for the relay's OR connection pipeline: it claims the
/// connection's identifier and closes the socket.
async fn consume_handoffs(
    mut rx: mpsc::Receiver<AcceptedConnection>,
    state: Arc<ServerState>,
) {
    while let Some(conn) = rx.recv().await {
        let id = conn.metadata.ext_or_id;
        if let Some(id) = id {
            match state.lookup_by_ext_or_id(&id) {
                Ok(handle) => tracing::debug!(
                    serial = handle.serial,
                    id = %id_hex(&id),
                    "claimed connection identifier"
                ),
                Err(e) => warn!(id = %id_hex(&id), "identifier lookup failed: {}", e),
            }
        }
        info!(
            peer = %conn.peer_addr,
            client = ?conn.metadata.client_addr,
            transport = conn.metadata.transport.as_deref().unwrap_or("-"),
            leftover = conn.leftover.len(),
            "accepted extended orport connection"
        );
    }
}
