//! Route definitions for the `/jobs` resource.
//!
//! Submission is open; every per-job read requires the job's bearer secret.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// POST   /                -> create_job
/// GET    /{id}            -> get_job
/// GET    /{id}/result     -> get_result
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(jobs::create_job))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/result", get(jobs::get_result))
}
