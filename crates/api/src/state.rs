use std::sync::Arc;

use docconv_worker::JobLifecycleEngine;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The job lifecycle engine: submission, polling and result reads.
    pub engine: Arc<JobLifecycleEngine>,
}
