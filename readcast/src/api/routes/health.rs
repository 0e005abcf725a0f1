//! Health check route.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::server::AppState;
use crate::metrics::SystemHealth;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub health: SystemHealth,
    pub uptime_secs: u64,
}

/// 200 while the service can take traffic (healthy or degraded), 503 otherwise.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.manager.health_check().await;
    let status = if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            health,
            uptime_secs: state.start_time.elapsed().as_secs(),
        }),
    )
}
