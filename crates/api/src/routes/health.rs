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
    /// Whether the job store is reachable.
    pub db_healthy: bool,
    /// Workers currently executing a job.
    pub busy_workers: usize,
    pub max_workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_jobs: Option<i64>,
}

/// GET /health -- returns service, store and pool health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.gateway.health().await;

    let status = if report.db_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy: report.db_healthy,
        busy_workers: report.busy_workers,
        max_workers: report.max_workers,
        pending_jobs: report.pending_jobs,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
