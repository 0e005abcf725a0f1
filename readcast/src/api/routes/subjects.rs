//! Per-subject routes: insights, schedule, manual trigger.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::InsightRecord;
use crate::scheduler::{ExecutionOutcome, ScheduleInfo};

/// Batch size used by a manual trigger for a subject without a schedule.
const DEFAULT_TRIGGER_CHUNKS: usize = 2;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{subject_id}/insights", get(get_insights))
        .route(
            "/{subject_id}/schedule",
            get(get_schedule).delete(cancel_schedule),
        )
        .route("/{subject_id}/trigger", post(trigger))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightsResponse {
    pub subject_id: String,
    pub insights: Vec<InsightRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub subject_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub chunks_per_delivery: Option<usize>,
}

async fn get_insights(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<InsightsResponse>> {
    let insights = state.pipeline.insights(&subject_id).await?;
    Ok(Json(InsightsResponse {
        subject_id,
        insights,
    }))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<ScheduleInfo>> {
    state
        .manager
        .schedule_info(&subject_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("schedule for subject '{}' not found", subject_id)))
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    if !state.manager.cancel(&subject_id).await? {
        return Err(ApiError::not_found(format!(
            "active schedule for subject '{}' not found",
            subject_id
        )));
    }
    Ok(Json(CancelResponse {
        subject_id,
        cancelled: true,
    }))
}

/// Fire a delivery now. The batch size defaults to the subject's schedule.
async fn trigger(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> ApiResult<Json<ExecutionOutcome>> {
    let chunks_per_delivery = match query.chunks_per_delivery {
        Some(n) => n,
        None => state
            .manager
            .schedule_info(&subject_id)
            .await?
            .map(|info| info.metadata.chunks_per_delivery)
            .unwrap_or(DEFAULT_TRIGGER_CHUNKS),
    };

    let outcome = state
        .manager
        .trigger_now(&subject_id, chunks_per_delivery)
        .await?;
    Ok(Json(outcome))
}
