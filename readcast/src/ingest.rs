//! Text ingestion: segment, store, deliver the first chunks, schedule the rest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{ProcessingMode, SubjectChunkSet};
use crate::pipeline::{DeliveryDispatcher, DeliveryPipeline};
use crate::scheduler::{PeriodicDeliveryManager, ScheduleRequest, SetupOutcome};
use crate::store::{KeyValueStore, KeyValueStoreExt, keys, retry_transient};
use crate::{Error, Result};

fn default_immediate_chunks() -> i64 {
    1
}

fn default_chunks_per_delivery() -> i64 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    pub subject_id: String,
    /// Where deliveries for this subject are sent.
    pub recipient: String,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default = "default_immediate_chunks")]
    pub immediate_chunks_count: i64,
    #[serde(default)]
    pub schedule_type: Option<String>,
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_chunks_per_delivery")]
    pub chunks_per_delivery: i64,
    #[serde(default)]
    pub hours_interval: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Everything requested was dispatched; no recurring job exists.
    Processed,
    /// A recurring job will deliver the remaining chunks.
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub subject_id: String,
    pub status: IngestStatus,
    pub total_chunks: usize,
    pub chunks_processed_immediately: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SetupOutcome>,
}

pub struct IngestService {
    store: Arc<dyn KeyValueStore>,
    pipeline: DeliveryPipeline,
    manager: Arc<PeriodicDeliveryManager>,
    max_chars: usize,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        pipeline: DeliveryPipeline,
        manager: Arc<PeriodicDeliveryManager>,
        max_chars: usize,
    ) -> Self {
        Self {
            store,
            pipeline,
            manager,
            max_chars,
        }
    }

    /// Reject malformed input before anything is stored.
    pub fn validate_request(&self, request: &IngestRequest) -> Result<()> {
        if request.subject_id.trim().is_empty() {
            return Err(Error::validation("subject_id is required"));
        }
        if request.recipient.trim().is_empty() {
            return Err(Error::validation("recipient is required"));
        }
        if request.text.trim().is_empty() {
            return Err(Error::validation("text must not be empty"));
        }
        if request.processing_mode.includes_schedule() {
            // Chunk count is not known yet; any positive total exercises
            // every other rule.
            self.manager
                .validator()
                .validate(&self.schedule_request(request, 1, 0))?;
        }
        Ok(())
    }

    fn schedule_request(
        &self,
        request: &IngestRequest,
        total_chunks: usize,
        immediate: usize,
    ) -> ScheduleRequest {
        ScheduleRequest {
            subject_id: request.subject_id.clone(),
            total_chunks: total_chunks as i64,
            schedule_type: request.schedule_type.clone(),
            schedule_time: request.schedule_time.clone(),
            timezone: request.timezone.clone(),
            hours_interval: request.hours_interval,
            chunks_per_delivery: Some(request.chunks_per_delivery),
            immediate_chunks_count: Some(immediate as i64),
        }
    }

    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport> {
        self.validate_request(request)?;
        let subject_id = request.subject_id.as_str();

        let segments = text_segmenter::segment(&request.text, self.max_chars);
        let total_chunks = segments.len();
        if total_chunks == 0 {
            return Err(Error::validation("text produced no chunks"));
        }

        let immediate = if request.processing_mode.includes_immediate() {
            request.immediate_chunks_count.clamp(0, total_chunks as i64) as usize
        } else {
            0
        };

        let schedule_request = self.schedule_request(request, total_chunks, immediate);
        if request.processing_mode.includes_schedule() {
            // Validate against the real chunk count before any state changes.
            self.manager.validator().validate(&schedule_request)?;
        }

        self.replace_previous(subject_id).await?;

        let chunk_set = SubjectChunkSet::new(subject_id, request.recipient.trim(), segments);
        let store = &self.store;
        let chunks_key = keys::chunks(subject_id);
        retry_transient("store subject chunks", || {
            store.set_json(&chunks_key, keys::SUBJECT_DATA_TTL, &chunk_set)
        })
        .await?;

        let immediate_task_id = if immediate > 0 {
            let slice = chunk_set.slice(0, immediate).to_vec();
            Some(self.pipeline.dispatch(subject_id, slice).await?)
        } else {
            None
        };

        self.manager
            .record_immediate_progress(subject_id, immediate, immediate_task_id.as_deref())
            .await?;

        let schedule = if request.processing_mode.includes_schedule() {
            Some(self.manager.setup(&schedule_request).await?)
        } else {
            None
        };

        let status = match &schedule {
            Some(outcome) if outcome.is_scheduled() => IngestStatus::Scheduled,
            _ => IngestStatus::Processed,
        };

        info!(
            subject_id,
            total_chunks,
            immediate,
            ?status,
            "Ingestion complete"
        );

        Ok(IngestReport {
            subject_id: subject_id.to_string(),
            status,
            total_chunks,
            chunks_processed_immediately: immediate,
            immediate_task_id,
            schedule,
        })
    }

    /// A re-ingested subject starts over: its old job, insights and delivery
    /// markers would otherwise apply to the new chunks.
    async fn replace_previous(&self, subject_id: &str) -> Result<()> {
        let previous: Option<SubjectChunkSet> =
            self.store.get_json(&keys::chunks(subject_id)).await?;
        let Some(previous) = previous else {
            return Ok(());
        };

        info!(subject_id, previous_chunks = previous.total_chunks, "Replacing previous ingestion");
        self.manager.cancel(subject_id).await?;
        self.pipeline
            .reset_subject(subject_id, previous.total_chunks)
            .await
    }
}
