use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Jobs waiting for a worker.
    pub queue_depth: usize,
    /// Conversions currently holding an execution slot.
    pub executions_in_flight: usize,
    pub execution_slots: usize,
    pub workers: usize,
}

/// GET /health -- returns service status and engine load.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_depth: engine.queue_depth(),
        executions_in_flight: engine.executions_in_flight(),
        execution_slots: engine.execution_slots(),
        workers: engine.workers(),
    })
}

/// Mount health check routes at the root level.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
