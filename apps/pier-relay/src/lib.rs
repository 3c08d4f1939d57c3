//! Pairing relay for pier endpoints.
//!
//! Endpoints open a WebSocket on `/ws`, announce `open {local, remote}` and are
//! started as soon as their counterpart registers the reverse pair. From then
//! on `sdp`, `ice` and `re_offer` envelopes are forwarded verbatim to the
//! registration named by their `remote` key.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub mod config;
pub mod error;
pub mod registry;
mod websocket;

pub use config::{RelayConfig, ServeArgs};
pub use error::RelayError;
pub use registry::{ConnectionId, Registry, RegistrationSnapshot};

#[derive(Clone)]
pub struct RelayState {
    inner: Arc<StateInner>,
}

struct StateInner {
    config: RelayConfig,
    registry: Registry,
    metrics: Option<PrometheusHandle>,
    next_connection: AtomicU64,
    active_connections: AtomicUsize,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_metrics(config: RelayConfig, metrics: PrometheusHandle) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                config,
                registry: Registry::new(),
                metrics,
                next_connection: AtomicU64::new(1),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) -> usize {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn connection_closed(&self) -> usize {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn stats(&self) -> StatsResponse {
        let registrations = self.registry().snapshot();
        StatsResponse {
            active_connections: self.active_connections(),
            registrations: registrations.len(),
            pairs: registrations,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub registrations: usize,
    pub pairs: Vec<RegistrationSnapshot>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "pier relay listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    match &state.inner.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
