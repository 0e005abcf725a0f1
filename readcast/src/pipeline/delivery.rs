//! Batch delivery: rate-limited generation, insight merge, notification fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use quota_limiter::QuotaManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::task_queue::{RetryPolicy, TaskQueue};
use crate::domain::{Chunk, InsightRecord, merge_insights};
use crate::generation::{DEFAULT_SYSTEM_PROMPT, GenerationError, GenerationService};
use crate::metrics::ComponentHealth;
use crate::notification::Notifier;
use crate::store::{KeyValueStore, KeyValueStoreExt, keys, retry_transient};
use crate::{Error, Result};

/// Hands a slice of chunks to background processing.
#[async_trait]
pub trait DeliveryDispatcher: Send + Sync {
    /// Queue `chunks` for delivery and return the task id.
    async fn dispatch(&self, subject_id: &str, chunks: Vec<Chunk>) -> Result<String>;

    fn health(&self) -> ComponentHealth;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Completion tokens assumed when checking quota for a chunk.
    pub estimated_completion_tokens: u64,
    /// Generation attempts when upstream answers with a rate limit.
    pub upstream_attempts: u32,
    pub upstream_backoff_ms: u64,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub notify_max_attempts: u32,
    pub notify_retry_delay_ms: u64,
    pub notify_max_retry_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            estimated_completion_tokens: 500,
            upstream_attempts: 2,
            upstream_backoff_ms: 1000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_output_tokens: 1400,
            notify_max_attempts: 3,
            notify_retry_delay_ms: 60_000,
            notify_max_retry_delay_ms: 600_000,
        }
    }
}

impl DeliveryConfig {
    pub fn notify_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.notify_max_attempts,
            Duration::from_millis(self.notify_retry_delay_ms),
            Duration::from_millis(self.notify_max_retry_delay_ms),
        )
    }
}

/// Result of one delivery batch, stored as the task result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub subject_id: String,
    pub chunk_indices: Vec<usize>,
    pub succeeded: usize,
    pub failed: usize,
    /// Size of the merged insight set after this batch.
    pub stored_insights: usize,
    pub notification_tasks: Vec<String>,
}

struct PipelineInner {
    quota: Arc<QuotaManager>,
    generator: Arc<dyn GenerationService>,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<Notifier>,
    queue: TaskQueue,
    config: DeliveryConfig,
    /// Sized to the burst request capacity so fan-out cannot outrun the bucket.
    permits: Semaphore,
    merge_locks: DashMap<String, Arc<Mutex<()>>>,
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<PipelineInner>,
}

impl DeliveryPipeline {
    pub fn new(
        quota: Arc<QuotaManager>,
        generator: Arc<dyn GenerationService>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<Notifier>,
        queue: TaskQueue,
        config: DeliveryConfig,
    ) -> Self {
        let permits = Semaphore::new(quota.request_burst_capacity().max(1) as usize);
        Self {
            inner: Arc::new(PipelineInner {
                quota,
                generator,
                store,
                notifier,
                queue,
                config,
                permits,
                merge_locks: DashMap::new(),
            }),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.inner.quota
    }

    /// Generate insights for `chunks`, merge them into the subject's insight
    /// set and queue one notification per chunk.
    ///
    /// Per-chunk failures become error records; only store failures fail the
    /// batch.
    pub async fn process_batch(&self, subject_id: &str, chunks: Vec<Chunk>) -> Result<BatchReport> {
        let started = Instant::now();
        info!(subject_id, chunks = chunks.len(), "Processing delivery batch");

        let records: Vec<InsightRecord> =
            join_all(chunks.iter().map(|chunk| self.process_chunk(subject_id, chunk))).await;

        let succeeded = records.iter().filter(|r| r.is_success()).count();
        let failed = records.len() - succeeded;
        let chunk_indices: Vec<usize> = records.iter().map(|r| r.chunk_index).collect();

        let stored_insights = self.merge_and_store(subject_id, records).await?;

        let mut notification_tasks = Vec::with_capacity(chunk_indices.len());
        for &chunk_index in &chunk_indices {
            match self.enqueue_notification(subject_id, chunk_index) {
                Ok(task_id) => notification_tasks.push(task_id),
                Err(e) => warn!(
                    subject_id,
                    chunk_index, "Failed to queue notification: {}", e
                ),
            }
        }

        info!(
            subject_id,
            succeeded,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Delivery batch processed"
        );

        Ok(BatchReport {
            subject_id: subject_id.to_string(),
            chunk_indices,
            succeeded,
            failed,
            stored_insights,
            notification_tasks,
        })
    }

    async fn process_chunk(&self, subject_id: &str, chunk: &Chunk) -> InsightRecord {
        let inner = &self.inner;
        let estimated_completion = inner.config.estimated_completion_tokens;

        let decision = inner.quota.can_process(&chunk.text, estimated_completion);
        if let Some(reason) = decision.reason.filter(|_| !decision.allowed) {
            debug!(subject_id, chunk_index = chunk.index, %reason, "Chunk denied by quota");
            return InsightRecord::failure(chunk.index, format!("Rate limit hit: {reason}"));
        }

        let Ok(_permit) = inner.permits.acquire().await else {
            return InsightRecord::failure(chunk.index, "Delivery pipeline closed");
        };

        if !inner.quota.acquire(&chunk.text, estimated_completion) {
            debug!(subject_id, chunk_index = chunk.index, "Lost burst capacity after check");
            return InsightRecord::failure(chunk.index, "Token acquisition failed");
        }

        let attempts = inner.config.upstream_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let result = inner
                .generator
                .generate(
                    &chunk.text,
                    &inner.config.system_prompt,
                    inner.config.max_output_tokens,
                )
                .await;

            match result {
                Ok(generation) => {
                    inner
                        .quota
                        .record_actual_usage(generation.usage, &chunk.text, &generation.model);
                    return InsightRecord::success(chunk.index, generation.content, generation.usage);
                }
                Err(GenerationError::RateLimited { status }) if attempt + 1 < attempts => {
                    let delay = Duration::from_millis(
                        inner
                            .config
                            .upstream_backoff_ms
                            .saturating_mul(2u64.saturating_pow(attempt)),
                    );
                    warn!(
                        subject_id,
                        chunk_index = chunk.index,
                        status,
                        "Upstream rate limited, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(subject_id, chunk_index = chunk.index, "Generation failed: {}", e);
                    return InsightRecord::failure(chunk.index, e.to_string());
                }
            }
        }
    }

    async fn merge_and_store(&self, subject_id: &str, records: Vec<InsightRecord>) -> Result<usize> {
        let lock = self
            .inner
            .merge_locks
            .entry(subject_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.merge_locked(subject_id, records).await
        };

        // Drop the subject's lock once no other batch holds or waits on it.
        drop(lock);
        self.inner
            .merge_locks
            .remove_if(subject_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn merge_locked(&self, subject_id: &str, records: Vec<InsightRecord>) -> Result<usize> {
        let key = keys::insights(subject_id);
        let store = &self.inner.store;

        let existing: Vec<InsightRecord> =
            retry_transient("load insights", || {
                store.get_json::<Vec<InsightRecord>>(&key)
            })
            .await?
            .unwrap_or_default();
        let merged = merge_insights(existing, records);

        retry_transient("store insights", || {
            store.set_json(&key, keys::SUBJECT_DATA_TTL, &merged)
        })
        .await?;

        Ok(merged.len())
    }

    /// Subjects with a live insight merge lock.
    pub fn merge_lock_count(&self) -> usize {
        self.inner.merge_locks.len()
    }

    fn enqueue_notification(&self, subject_id: &str, chunk_index: usize) -> Result<String> {
        let notifier = self.inner.notifier.clone();
        let subject = subject_id.to_string();
        let handle = self.inner.queue.submit(
            "notify_chunk",
            self.inner.config.notify_policy(),
            move || {
                let notifier = notifier.clone();
                let subject = subject.clone();
                async move { notifier.notify(&subject, chunk_index).await }
            },
        )?;
        Ok(handle.id().to_string())
    }

    /// Merged insight set for a subject, ordered by chunk index.
    pub async fn insights(&self, subject_id: &str) -> Result<Vec<InsightRecord>> {
        Ok(self
            .inner
            .store
            .get_json(&keys::insights(subject_id))
            .await?
            .unwrap_or_default())
    }

    /// Forget insights and delivery markers of a previous ingestion.
    pub async fn reset_subject(&self, subject_id: &str, previous_chunks: usize) -> Result<()> {
        let store = &self.inner.store;
        store.delete(&keys::insights(subject_id)).await?;
        for index in 0..previous_chunks {
            store.delete(&keys::delivery_marker(subject_id, index)).await?;
        }
        debug!(subject_id, previous_chunks, "Reset subject delivery state");
        Ok(())
    }
}

#[async_trait]
impl DeliveryDispatcher for DeliveryPipeline {
    async fn dispatch(&self, subject_id: &str, chunks: Vec<Chunk>) -> Result<String> {
        if chunks.is_empty() {
            return Err(Error::validation("cannot dispatch an empty batch"));
        }

        let pipeline = self.clone();
        let subject = subject_id.to_string();
        let handle = self
            .inner
            .queue
            .submit("deliver_batch", RetryPolicy::none(), move || {
                let pipeline = pipeline.clone();
                let subject = subject.clone();
                let chunks = chunks.clone();
                async move { pipeline.process_batch(&subject, chunks).await }
            })?;

        debug!(subject_id, task_id = handle.id(), "Delivery batch queued");
        Ok(handle.id().to_string())
    }

    fn health(&self) -> ComponentHealth {
        self.inner.queue.health()
    }
}
