//! Administrative routes: quota usage, system metrics, cleanup, log filter.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use quota_limiter::{BurstStats, EstimationAccuracy, UsageRecord, UsageStats};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::QueueStats;
use crate::scheduler::CleanupReport;

/// Usage records included in the quota view.
const RECENT_USAGE_LIMIT: usize = 10;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/quota", get(get_quota))
        .route("/metrics", get(get_metrics))
        .route("/cleanup", post(run_cleanup))
        .route("/logging", get(get_log_filter).put(set_log_filter))
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub usage: UsageStats,
    pub burst: BurstStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimation_accuracy: Option<EstimationAccuracy>,
    pub recent_usage: Vec<UsageRecord>,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub quota: UsageStats,
    pub task_queue: QueueStats,
    pub registered_jobs: usize,
    pub schedule_records: usize,
    pub progress_records: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

async fn get_quota(State(state): State<AppState>) -> Json<QuotaResponse> {
    let quota = state.pipeline.quota();
    Json(QuotaResponse {
        usage: quota.stats(),
        burst: quota.burst_stats(),
        estimation_accuracy: quota.estimation_accuracy(),
        recent_usage: quota.recent_usage(RECENT_USAGE_LIMIT),
    })
}

async fn get_metrics(State(state): State<AppState>) -> ApiResult<Json<SystemMetrics>> {
    let (schedule_records, progress_records) = state.manager.key_counts().await?;
    Ok(Json(SystemMetrics {
        quota: state.pipeline.quota().stats(),
        task_queue: state.pipeline.queue().stats(),
        registered_jobs: state.manager.registry().registered_jobs().len(),
        schedule_records,
        progress_records,
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

async fn run_cleanup(State(state): State<AppState>) -> ApiResult<Json<CleanupReport>> {
    Ok(Json(state.manager.cleanup_expired_data().await?))
}

async fn get_log_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    Ok(Json(LogFilter {
        filter: config.get_filter(),
    }))
}

async fn set_log_filter(
    State(state): State<AppState>,
    Json(request): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    config.set_filter(&request.filter)?;
    Ok(Json(LogFilter {
        filter: config.get_filter(),
    }))
}
