pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the route tree.
///
/// ```text
/// /health                 service health
/// /jobs                   list, submit
/// /jobs/{id}              status, cancel
/// /jobs/{id}/output       normalized artifact
/// ```
pub fn app_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/jobs", jobs::router())
}
