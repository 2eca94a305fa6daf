use axum::{
    Router,
    routing::{get, post, put},
};

pub mod jobs;
pub mod status;
pub mod system;
pub mod ws;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/usage", get(system::usage))
        .route("/queue", get(system::queue_stats))
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/status", get(status::get_status))
        .route("/jobs/:id/cancel", put(jobs::cancel_job))
        .route("/jobs/:id/retry", put(jobs::retry_job))
        .route("/ws", get(ws::ws_handler))
}
