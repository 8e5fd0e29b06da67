//! `api` crate: HTTP surface of the workspace execution pipeline.
//!
//! Administrative routes live under `/api/v1/batch-specs`, `/api/v1/jobs`
//! and `/api/v1/workspaces`; the worker protocol lives under
//! `/api/v1/worker`. Every handler is a thin shim over
//! [`pipeline::ExecutionController`].

pub mod error;
pub mod handlers;

use std::future::Future;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use pipeline::ExecutionController;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: ExecutionController,
}

impl AppState {
    pub fn new(controller: ExecutionController) -> Self {
        Self { controller }
    }
}

pub const V1_PREFIX: &str = "/api/v1";

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        // Administrative
        .route("/batch-specs/:id/jobs", post(handlers::admin::create_jobs))
        .route("/batch-specs/:id/skip", post(handlers::admin::mark_skipped))
        .route("/batch-specs/:id/cancel", post(handlers::admin::cancel_batch_spec))
        .route("/jobs", get(handlers::admin::list_jobs))
        .route("/jobs/cancel", post(handlers::admin::cancel_jobs))
        .route("/jobs/retry", post(handlers::admin::retry_jobs))
        .route("/jobs/:id", get(handlers::admin::get_job))
        .route("/workspaces/:id/job", get(handlers::admin::get_job_by_workspace))
        // Worker protocol
        .route("/worker/dequeue", post(handlers::worker::dequeue))
        .route("/worker/heartbeat", post(handlers::worker::heartbeat))
        .route("/worker/jobs/:id/logs", post(handlers::worker::add_log_entry))
        .route("/worker/jobs/:id/complete", post(handlers::worker::complete))
        .route("/worker/jobs/:id/fail", post(handlers::worker::fail))
        .route("/worker/jobs/:id/error", post(handlers::worker::error))
        .route("/worker/jobs/:id/canceled", post(handlers::worker::canceled));

    Router::new()
        .nest(V1_PREFIX, v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}
