//! API route modules.
//!
//! Organizes routes by resource type.

pub mod admin;
pub mod health;
pub mod ingest;
pub mod subjects;
pub mod tasks;

use axum::Router;
use axum::routing::{get, post};

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest::ingest))
        .nest("/api/tasks", tasks::router())
        .nest("/api/subjects", subjects::router())
        .nest("/api/admin", admin::router())
        .route("/health", get(health::health_check))
        .with_state(state)
}
