//! HTTP liveness probe.

use std::sync::Arc;

use affinity_core::SessionProbe;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::protocol::{ProbeRequest, ProbeResponse};

/// Probe handler state.
#[derive(Clone)]
pub struct ProbeState {
    probe: Arc<dyn SessionProbe>,
}

impl ProbeState {
    #[must_use]
    pub fn new(probe: Arc<dyn SessionProbe>) -> Self {
        Self { probe }
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn session_handler(
    State(state): State<ProbeState>,
    Path(token): Path<String>,
) -> Json<ProbeResponse> {
    let alive = state.probe.is_alive(&token);
    tracing::debug!(%token, alive, "Liveness probe");
    Json(ProbeResponse::Liveness { token, alive })
}

async fn probe_handler(
    State(state): State<ProbeState>,
    Json(request): Json<ProbeRequest>,
) -> Json<ProbeResponse> {
    Json(request.answer(state.probe.as_ref()))
}

/// Create the probe router.
///
/// Routes:
/// - `GET /health`
/// - `GET /sessions/{token}` - liveness of one token
/// - `POST /probe` - JSON [`ProbeRequest`]
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_probe_router(scheduler.probe()));
/// ```
#[must_use]
pub fn create_probe_router(probe: Arc<dyn SessionProbe>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions/{token}", get(session_handler))
        .route("/probe", post(probe_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ProbeState::new(probe))
}
