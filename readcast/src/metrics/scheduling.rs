//! Scheduling audit records.
//!
//! Each event is logged and persisted under `metrics:*` with a seven-day
//! retention. Recording never fails the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::ScheduleType;
use crate::store::{KeyValueStore, KeyValueStoreExt, keys};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricRecord {
    ScheduleCreated {
        subject_id: String,
        schedule_type: ScheduleType,
        recorded_at: DateTime<Utc>,
    },
    ScheduleExecuted {
        subject_id: String,
        chunks_processed: usize,
        execution_time_ms: u64,
        recorded_at: DateTime<Utc>,
    },
    SchedulingError {
        subject_id: String,
        error_type: String,
        error_details: String,
        recorded_at: DateTime<Utc>,
    },
}

impl MetricRecord {
    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            Self::ScheduleCreated { recorded_at, .. }
            | Self::ScheduleExecuted { recorded_at, .. }
            | Self::SchedulingError { recorded_at, .. } => *recorded_at,
        }
    }
}

#[derive(Clone)]
pub struct SchedulingMetrics {
    store: Arc<dyn KeyValueStore>,
}

impl SchedulingMetrics {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn record_schedule_created(&self, subject_id: &str, schedule_type: ScheduleType) {
        info!(
            event = "schedule_created",
            subject_id,
            %schedule_type,
            "scheduling metric"
        );
        let key = keys::metric("schedule_created", subject_id, None);
        self.persist(
            &key,
            MetricRecord::ScheduleCreated {
                subject_id: subject_id.to_string(),
                schedule_type,
                recorded_at: Utc::now(),
            },
        )
        .await;
    }

    pub async fn record_schedule_execution(
        &self,
        subject_id: &str,
        chunks_processed: usize,
        execution_time: Duration,
    ) {
        let execution_time_ms = execution_time.as_millis() as u64;
        info!(
            event = "schedule_executed",
            subject_id,
            chunks_processed,
            execution_time_ms,
            "scheduling metric"
        );
        let now = Utc::now();
        let key = keys::metric("schedule_executed", subject_id, Some(now.timestamp_millis()));
        self.persist(
            &key,
            MetricRecord::ScheduleExecuted {
                subject_id: subject_id.to_string(),
                chunks_processed,
                execution_time_ms,
                recorded_at: now,
            },
        )
        .await;
    }

    pub async fn record_error(&self, error_type: &str, subject_id: &str, details: &str) {
        error!(
            event = "scheduling_error",
            error_type,
            subject_id,
            details,
            "scheduling error"
        );
        let now = Utc::now();
        let key = keys::metric("error", subject_id, Some(now.timestamp_millis()));
        self.persist(
            &key,
            MetricRecord::SchedulingError {
                subject_id: subject_id.to_string(),
                error_type: error_type.to_string(),
                error_details: details.to_string(),
                recorded_at: now,
            },
        )
        .await;
    }

    async fn persist(&self, key: &str, record: MetricRecord) {
        if let Err(e) = self.store.set_json(key, keys::METRICS_TTL, &record).await {
            warn!(key, error = %e, "Failed to persist scheduling metric");
        }
    }
}
