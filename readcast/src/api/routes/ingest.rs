//! Ingestion route.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::ingest::IngestRequest;
use crate::pipeline::RetryPolicy;

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestAccepted {
    pub task_id: String,
    pub status: String,
}

/// Validate the request, then run the ingestion as a background task.
pub async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<IngestAccepted>)> {
    state.ingest.validate_request(&request)?;

    let service = state.ingest.clone();
    let request = Arc::new(request);
    let subject_id = request.subject_id.clone();
    let handle = state
        .pipeline
        .queue()
        .submit("ingest", RetryPolicy::none(), move || {
            let service = service.clone();
            let request = request.clone();
            async move { service.ingest(&request).await }
        })?;

    info!(subject_id = %subject_id, task_id = handle.id(), "Ingestion accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted {
            task_id: handle.id().to_string(),
            status: "accepted".to_string(),
        }),
    ))
}
