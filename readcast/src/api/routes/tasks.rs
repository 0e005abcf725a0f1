//! Task status routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::TaskSnapshot;

pub fn router() -> Router<AppState> {
    Router::new().route("/{task_id}", get(get_task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskSnapshot>> {
    state
        .pipeline
        .queue()
        .status(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("task with id '{}' not found", task_id)))
}
