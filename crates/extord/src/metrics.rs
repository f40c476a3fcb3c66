use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Body of `/health` and `/ready`.
#[derive(Serialize)]
struct Probe {
    status: &'static str,
    ready: bool,
}

/// Readiness flag shared between `main` and the `/ready` endpoint.
///
/// Starts out not ready; `main` flips it once the cookie is on disk and
/// the listener is bound, and back again on shutdown.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// New flag, not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Current readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct Endpoints {
    prometheus: PrometheusHandle,
    health: HealthState,
}

/// Installs the Prometheus recorder and serves `/metrics`, `/health` and
/// `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if installing the recorder or binding the metrics HTTP
/// server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let endpoints = Endpoints {
        prometheus: PrometheusBuilder::new().install_recorder()?,
        health: health_state,
    };
    let app = Router::new()
        .route("/metrics", get(|State(e): State<Endpoints>| async move { e.prometheus.render() }))
        .route("/health", get(health_handler))
        .route("/ready", get(|State(e): State<Endpoints>| ready_handler(e.health)))
        .with_state(endpoints);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<Probe> {
    Json(Probe {
        status: "healthy",
        ready: true,
    })
}

/// 200 once the cookie is loaded and the listener bound, 503 otherwise.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<Probe>) {
    let ready = state.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if ready { "ready" } else { "not ready" };
    (code, Json(Probe { status, ready }))
}

/// Gauges.
pub mod gauges {
    /// A connection task started.
    pub fn inc_connections_active() {
        metrics::gauge!("extor_connections_active").increment(1.0);
    }

    /// A connection task ended.
    pub fn dec_connections_active() {
        metrics::gauge!("extor_connections_active").decrement(1.0);
    }
}

/// Counters.
pub mod counters {
    /// Record a handshake outcome with the given status label.
    pub fn auth_total(status: &'static str) {
        metrics::counter!("extor_auth_total", "status" => status).increment(1);
    }

    /// Increment the handed-off connections counter.
    pub fn handoffs_total() {
        metrics::counter!("extor_handoffs_total").increment(1);
    }
}

/// Histograms.
pub mod histograms {
    /// Record time from accept to handoff in seconds.
    pub fn handshake_seconds(value: f64) {
        metrics::histogram!("extor_handshake_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_starts_not_ready() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
    }

    #[test]
    fn health_state_clones_share_flag() {
        let a = HealthState::new();
        let b = a.clone();
        a.set_ready(true);
        assert!(b.is_ready());
    }

    #[tokio::test]
    async fn ready_handler_reflects_state() {
        let state = HealthState::new();
        let (code, _) = ready_handler(state.clone()).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        state.set_ready(true);
        let (code, Json(body)) = ready_handler(state).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.ready);
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        counters::auth_total("accepted");
        counters::handoffs_total();
        gauges::inc_connections_active();
        gauges::dec_connections_active();
        histograms::handshake_seconds(0.01);
    }
}
