// Route definitions for the Arbiter API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/judge", post(handlers::submit))
        .route("/submission/:id", get(handlers::submission_status))
        .route("/submissions", get(handlers::list_submissions))
        .route("/problems", get(handlers::list_problems))
        .route("/problem/:id/metadata", get(handlers::problem_metadata))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
}
