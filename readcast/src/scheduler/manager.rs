//! Per-subject recurring delivery.
//!
//! A subject moves `unscheduled -> active -> completed`. [`PeriodicDeliveryManager::setup`]
//! registers one recurring job per subject and persists its
//! [`ScheduleMetadata`]; each firing runs [`PeriodicDeliveryManager::execute_batch`],
//! which hands the next slice of chunks to the delivery pipeline and advances
//! the subject's [`ProgressState`]. The schedule completes on cancellation,
//! when the last slice has been dispatched, or when the subject's chunks have
//! disappeared from the store.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{Firing, FiringArgs, SchedulerRegistry};
use super::trigger::TriggerSpec;
use super::validator::{
    MAX_CHUNKS_PER_DELIVERY, MIN_CHUNKS_PER_DELIVERY, ScheduleRequest, ScheduleValidator,
    ValidatedSchedule, ValidationWarning,
};
use crate::domain::{ProgressState, ScheduleMetadata, ScheduleStatus, ScheduleType, SubjectChunkSet};
use crate::metrics::{ComponentHealth, MetricRecord, SchedulingMetrics, SystemHealth};
use crate::pipeline::DeliveryDispatcher;
use crate::store::{KeyValueStore, KeyValueStoreExt, keys, retry_transient};
use crate::{Error, Result};

/// Registry name of a subject's recurring job.
pub fn job_name(subject_id: &str) -> String {
    format!("process_subject_chunks_{subject_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SetupOutcome {
    Scheduled {
        job_name: String,
        schedule_type: ScheduleType,
        remaining_chunks: usize,
        next_execution: Option<DateTime<Utc>>,
        warnings: Vec<ValidationWarning>,
    },
    /// Nothing to schedule. Not an error.
    NotScheduled { reason: String },
}

impl SetupOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    BatchQueued {
        task_id: String,
        batch_start: usize,
        batch_end: usize,
        chunks_queued: usize,
        total_processed: usize,
        remaining_chunks: usize,
        /// The schedule is no longer active after this batch, either because
        /// the final slice was dispatched or because it was cancelled while
        /// the batch was in flight.
        completed: bool,
    },
    /// The subject had nothing left to deliver; its job is gone.
    Completed { total_processed: usize },
    /// Another firing for the subject was still running.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub subject_id: String,
    pub metadata: ScheduleMetadata,
    pub progress: Option<ProgressState>,
    pub registered: bool,
    pub next_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub metrics_cleaned: usize,
    pub progress_cleaned: usize,
}

struct SubjectGuard<'a> {
    in_flight: &'a DashSet<String>,
    subject_id: String,
}

impl Drop for SubjectGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.subject_id);
    }
}

pub struct PeriodicDeliveryManager {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<dyn SchedulerRegistry>,
    dispatcher: Arc<dyn DeliveryDispatcher>,
    validator: ScheduleValidator,
    metrics: SchedulingMetrics,
    in_flight: DashSet<String>,
    /// Serializes schedule status transitions against progress updates.
    transitions: Mutex<()>,
}

impl PeriodicDeliveryManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        registry: Arc<dyn SchedulerRegistry>,
        dispatcher: Arc<dyn DeliveryDispatcher>,
        validator: ScheduleValidator,
    ) -> Self {
        Self {
            metrics: SchedulingMetrics::new(store.clone()),
            store,
            registry,
            dispatcher,
            validator,
            in_flight: DashSet::new(),
            transitions: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn SchedulerRegistry> {
        &self.registry
    }

    pub fn validator(&self) -> &ScheduleValidator {
        &self.validator
    }

    /// Validate `request` and, when there is something left to deliver,
    /// register the subject's recurring job.
    ///
    /// A repeated setup for the same subject replaces the previous job.
    pub async fn setup(&self, request: &ScheduleRequest) -> Result<SetupOutcome> {
        let normalized = match self.validator.validate(request) {
            Ok(ValidatedSchedule::Recurring(normalized)) => normalized,
            Ok(ValidatedSchedule::Unscheduled(_)) => {
                debug!(subject_id = %request.subject_id, "Schedule type none, nothing to register");
                return Ok(SetupOutcome::NotScheduled {
                    reason: "schedule_type is none".to_string(),
                });
            }
            Err(e) => {
                self.metrics
                    .record_error("validation_error", &request.subject_id, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let subject_id = normalized.subject_id.as_str();
        let remaining_chunks = normalized.remaining_chunks();
        if remaining_chunks == 0 {
            info!(subject_id, "All chunks delivered immediately, no schedule needed");
            return Ok(SetupOutcome::NotScheduled {
                reason: "no chunks remaining after immediate delivery".to_string(),
            });
        }

        let now = Utc::now();
        let trigger = TriggerSpec::for_schedule(
            normalized.schedule_type,
            normalized.schedule_time,
            normalized.hours_interval,
            normalized.timezone,
            now,
        )?;

        let job = job_name(subject_id);
        let args = FiringArgs {
            subject_id: subject_id.to_string(),
            chunks_per_delivery: normalized.chunks_per_delivery,
            start_index: normalized.immediate_chunks_count,
        };

        if let Err(e) = self.registry.register(&job, trigger.clone(), args) {
            self.metrics
                .record_error("setup_error", subject_id, &e.to_string())
                .await;
            return Err(e);
        }

        let metadata = ScheduleMetadata {
            subject_id: subject_id.to_string(),
            job_name: job.clone(),
            schedule_type: normalized.schedule_type,
            schedule_time: normalized.schedule_time,
            timezone: normalized.timezone.name().to_string(),
            hours_interval: normalized.hours_interval,
            cron_expression: trigger.expression().to_string(),
            chunks_per_delivery: normalized.chunks_per_delivery,
            start_index: normalized.immediate_chunks_count,
            total_chunks: normalized.total_chunks,
            remaining_chunks,
            status: ScheduleStatus::Active,
            created_at: now,
            completed_at: None,
        };

        let store = &self.store;
        let schedule_key = keys::schedule(subject_id);
        let persisted = retry_transient("persist schedule metadata", || {
            store.set_json(&schedule_key, keys::ACTIVE_SCHEDULE_TTL, &metadata)
        })
        .await;

        if let Err(e) = persisted {
            // Without metadata the job could never be cancelled or resumed.
            self.registry.deregister(&job);
            self.metrics
                .record_error("setup_error", subject_id, &e.to_string())
                .await;
            return Err(e);
        }

        self.metrics
            .record_schedule_created(subject_id, normalized.schedule_type)
            .await;

        let next_execution = trigger.next_after(now);
        info!(
            subject_id,
            job = %job,
            schedule_type = %normalized.schedule_type,
            expression = trigger.expression(),
            remaining_chunks,
            "Schedule created"
        );

        Ok(SetupOutcome::Scheduled {
            job_name: job,
            schedule_type: normalized.schedule_type,
            remaining_chunks,
            next_execution,
            warnings: normalized.warnings,
        })
    }

    /// Stop the subject's recurring job and mark its schedule completed.
    ///
    /// Returns `false` when there was no active schedule.
    pub async fn cancel(&self, subject_id: &str) -> Result<bool> {
        self.complete_schedule(subject_id, None).await
    }

    async fn complete_schedule(&self, subject_id: &str, remaining: Option<usize>) -> Result<bool> {
        let _transition = self.transitions.lock().await;
        self.complete_schedule_locked(subject_id, remaining).await
    }

    async fn complete_schedule_locked(
        &self,
        subject_id: &str,
        remaining: Option<usize>,
    ) -> Result<bool> {
        let job = job_name(subject_id);
        let deregistered = self.registry.deregister(&job);

        let store = &self.store;
        let schedule_key = keys::schedule(subject_id);
        let metadata: Option<ScheduleMetadata> =
            retry_transient("load schedule metadata", || store.get_json(&schedule_key)).await?;

        let Some(mut metadata) = metadata else {
            debug!(subject_id, deregistered, "No schedule metadata to complete");
            return Ok(false);
        };

        if !metadata.complete(Utc::now()) {
            debug!(subject_id, "Schedule already completed");
            return Ok(false);
        }
        if let Some(remaining) = remaining {
            metadata.remaining_chunks = remaining;
        }

        retry_transient("persist completed schedule", || {
            store.set_json(&schedule_key, keys::COMPLETED_SCHEDULE_TTL, &metadata)
        })
        .await?;

        let progress_key = keys::progress(subject_id);
        retry_transient("delete progress", || store.delete(&progress_key)).await?;

        info!(subject_id, job = %job, deregistered, "Schedule completed");
        Ok(true)
    }

    /// Run one firing of a subject's job.
    ///
    /// Overlapping firings for the same subject are skipped.
    pub async fn execute_batch(&self, args: &FiringArgs) -> Result<ExecutionOutcome> {
        let subject_id = args.subject_id.as_str();
        if !self.in_flight.insert(subject_id.to_string()) {
            warn!(subject_id, "Previous batch still running, skipping firing");
            return Ok(ExecutionOutcome::Skipped {
                reason: "a batch for this subject is already running".to_string(),
            });
        }
        let _guard = SubjectGuard {
            in_flight: &self.in_flight,
            subject_id: subject_id.to_string(),
        };

        let result = self.run_batch(args).await;
        if let Err(e) = &result {
            self.metrics
                .record_error("execution_error", subject_id, &e.to_string())
                .await;
        }
        result
    }

    async fn run_batch(&self, args: &FiringArgs) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let subject_id = args.subject_id.as_str();
        let store = &self.store;

        let schedule_key = keys::schedule(subject_id);
        let metadata: Option<ScheduleMetadata> =
            retry_transient("load schedule metadata", || store.get_json(&schedule_key)).await?;

        if let Some(metadata) = metadata.as_ref().filter(|m| !m.is_active()) {
            self.registry.deregister(&job_name(subject_id));
            return Ok(ExecutionOutcome::Completed {
                total_processed: metadata
                    .total_chunks
                    .saturating_sub(metadata.remaining_chunks),
            });
        }

        let progress_key = keys::progress(subject_id);
        let progress: ProgressState =
            retry_transient("load progress", || {
                store.get_json::<ProgressState>(&progress_key)
            })
                .await?
                .unwrap_or_else(|| ProgressState::starting_at(args.start_index));

        let chunks_key = keys::chunks(subject_id);
        let chunk_set: Option<SubjectChunkSet> =
            retry_transient("load subject chunks", || store.get_json(&chunks_key)).await?;

        let Some(chunk_set) = chunk_set else {
            warn!(subject_id, "Subject chunks missing, cancelling orphaned schedule");
            self.complete_schedule(subject_id, None).await?;
            return Ok(ExecutionOutcome::Completed {
                total_processed: progress.processed_count,
            });
        };

        let total = chunk_set.total_chunks;
        let batch_start = progress.current_index;
        let batch_end = batch_start
            .saturating_add(args.chunks_per_delivery)
            .min(total);

        if batch_start >= batch_end {
            info!(
                subject_id,
                processed = progress.processed_count,
                "All chunks delivered, completing schedule"
            );
            self.complete_schedule(subject_id, Some(0)).await?;
            return Ok(ExecutionOutcome::Completed {
                total_processed: progress.processed_count,
            });
        }

        let slice = chunk_set.slice(batch_start, batch_end).to_vec();
        let chunks_queued = slice.len();
        let task_id = self.dispatcher.dispatch(subject_id, slice).await?;
        let updated = progress.advanced(batch_end, &task_id);
        let remaining_chunks = total - batch_end;

        // The schedule may have been cancelled while the batch was being
        // dispatched; a completed schedule must not be written back.
        let transition = self.transitions.lock().await;
        let latest: Option<ScheduleMetadata> =
            retry_transient("reload schedule metadata", || store.get_json(&schedule_key)).await?;
        let superseded = match &latest {
            Some(latest) => !latest.is_active(),
            None => metadata.is_some(),
        };

        let completed = if superseded {
            info!(
                subject_id,
                task_id = %task_id,
                "Schedule ended while the batch was in flight, progress not advanced"
            );
            true
        } else {
            retry_transient("persist progress", || {
                store.set_json(&progress_key, keys::SUBJECT_DATA_TTL, &updated)
            })
            .await?;

            if let Some(mut latest) = latest.filter(|_| remaining_chunks > 0) {
                latest.remaining_chunks = remaining_chunks;
                retry_transient("update schedule metadata", || {
                    store.set_json(&schedule_key, keys::ACTIVE_SCHEDULE_TTL, &latest)
                })
                .await?;
            }

            if remaining_chunks == 0 {
                self.complete_schedule_locked(subject_id, Some(0)).await?;
            }
            remaining_chunks == 0
        };
        drop(transition);

        self.metrics
            .record_schedule_execution(subject_id, chunks_queued, started.elapsed())
            .await;

        info!(
            subject_id,
            task_id = %task_id,
            batch_start,
            batch_end,
            remaining_chunks,
            "Scheduled batch dispatched"
        );

        Ok(ExecutionOutcome::BatchQueued {
            task_id,
            batch_start,
            batch_end,
            chunks_queued,
            total_processed: updated.processed_count,
            remaining_chunks,
            completed,
        })
    }

    /// Record the progress left behind by the immediate batch of a fresh
    /// ingestion. Replaces any earlier progress for the subject.
    pub async fn record_immediate_progress(
        &self,
        subject_id: &str,
        delivered: usize,
        task_id: Option<&str>,
    ) -> Result<ProgressState> {
        let progress = match task_id {
            Some(task_id) if delivered > 0 => ProgressState::starting_at(0).advanced(delivered, task_id),
            _ => ProgressState::starting_at(delivered),
        };

        let store = &self.store;
        let progress_key = keys::progress(subject_id);
        retry_transient("persist progress", || {
            store.set_json(&progress_key, keys::SUBJECT_DATA_TTL, &progress)
        })
        .await?;
        Ok(progress)
    }

    /// Manually fire a subject's delivery with an explicit batch size.
    pub async fn trigger_now(
        &self,
        subject_id: &str,
        chunks_per_delivery: usize,
    ) -> Result<ExecutionOutcome> {
        if !(MIN_CHUNKS_PER_DELIVERY..=MAX_CHUNKS_PER_DELIVERY).contains(&(chunks_per_delivery as i64)) {
            return Err(Error::validation(format!(
                "chunks_per_delivery must be between {MIN_CHUNKS_PER_DELIVERY} and {MAX_CHUNKS_PER_DELIVERY}"
            )));
        }
        if !self.store.exists(&keys::chunks(subject_id)).await? {
            return Err(Error::not_found("subject chunks", subject_id));
        }

        let metadata: Option<ScheduleMetadata> =
            self.store.get_json(&keys::schedule(subject_id)).await?;
        let start_index = metadata.map(|m| m.start_index).unwrap_or_default();

        info!(subject_id, chunks_per_delivery, "Manual delivery triggered");
        self.execute_batch(&FiringArgs {
            subject_id: subject_id.to_string(),
            chunks_per_delivery,
            start_index,
        })
        .await
    }

    pub async fn schedule_info(&self, subject_id: &str) -> Result<Option<ScheduleInfo>> {
        let Some(metadata) = self
            .store
            .get_json::<ScheduleMetadata>(&keys::schedule(subject_id))
            .await?
        else {
            return Ok(None);
        };
        let progress = self.store.get_json(&keys::progress(subject_id)).await?;

        let job = job_name(subject_id);
        Ok(Some(ScheduleInfo {
            subject_id: subject_id.to_string(),
            registered: self.registry.is_registered(&job),
            next_execution: self.registry.next_fire(&job),
            metadata,
            progress,
        }))
    }

    /// Number of persisted schedule and progress records.
    pub async fn key_counts(&self) -> Result<(usize, usize)> {
        let schedules = self.store.keys_matching(keys::SCHEDULE_PATTERN).await?.len();
        let progress = self.store.keys_matching(keys::PROGRESS_PATTERN).await?.len();
        Ok((schedules, progress))
    }

    /// Re-register every active schedule found in the store. Returns the
    /// number of jobs registered.
    pub async fn resume_active(&self) -> Result<usize> {
        let schedule_keys = self.store.keys_matching(keys::SCHEDULE_PATTERN).await?;
        let mut resumed = 0;

        for key in schedule_keys {
            let metadata = match self.store.get_json::<ScheduleMetadata>(&key).await {
                Ok(Some(metadata)) if metadata.is_active() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!(key = %key, "Skipping unreadable schedule: {}", e);
                    continue;
                }
            };

            if self.registry.is_registered(&metadata.job_name) {
                continue;
            }

            let timezone = metadata
                .timezone
                .parse::<Tz>()
                .unwrap_or_else(|_| self.validator.default_timezone());
            let trigger = match TriggerSpec::parse(&metadata.cron_expression, timezone) {
                Ok(trigger) => trigger,
                Err(e) => {
                    error!(subject_id = %metadata.subject_id, "Cannot resume schedule: {}", e);
                    continue;
                }
            };

            let args = FiringArgs {
                subject_id: metadata.subject_id.clone(),
                chunks_per_delivery: metadata.chunks_per_delivery,
                start_index: metadata.start_index,
            };
            match self.registry.register(&metadata.job_name, trigger, args) {
                Ok(()) => resumed += 1,
                Err(e) => error!(subject_id = %metadata.subject_id, "Cannot resume schedule: {}", e),
            }
        }

        info!(resumed, "Resumed active schedules");
        Ok(resumed)
    }

    /// Execute firings from a registry until cancelled or the channel closes.
    pub fn run_dispatcher(
        self: Arc<Self>,
        mut firings: mpsc::Receiver<Firing>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Firing dispatcher started");
            loop {
                let firing = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    firing = firings.recv() => match firing {
                        Some(firing) => firing,
                        None => break,
                    },
                };

                let manager = self.clone();
                tokio::spawn(async move {
                    let subject_id = firing.args.subject_id.clone();
                    match manager.execute_batch(&firing.args).await {
                        Ok(outcome) => debug!(
                            subject_id = %subject_id,
                            job = %firing.job_name,
                            ?outcome,
                            "Firing handled"
                        ),
                        Err(e) => error!(
                            subject_id = %subject_id,
                            job = %firing.job_name,
                            "Scheduled batch failed: {}",
                            e
                        ),
                    }
                });
            }
            info!("Firing dispatcher stopped");
        })
    }

    /// Independent status of the manager, the store and the task queue.
    pub async fn health_check(&self) -> SystemHealth {
        let manager = ComponentHealth::healthy("manager").with_message(format!(
            "{} jobs registered",
            self.registry.registered_jobs().len()
        ));

        let started = Instant::now();
        let store = match self.store.ping().await {
            Ok(()) => ComponentHealth::healthy("store").with_message(self.store.backend()),
            Err(e) => ComponentHealth::unhealthy("store", e.to_string()),
        }
        .with_duration(started.elapsed());

        let queue = self.dispatcher.health();

        SystemHealth::from_components(vec![manager, store, queue])
    }

    /// Delete metric records past retention and progress records that are
    /// past retention or belong to subjects with neither an active schedule
    /// nor stored chunks. Per-key failures are logged and skipped.
    pub async fn cleanup_expired_data(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        let metrics_retention = chrono::Duration::from_std(keys::METRICS_TTL)
            .map_err(|e| Error::Other(e.to_string()))?;
        let progress_retention = chrono::Duration::from_std(keys::SUBJECT_DATA_TTL)
            .map_err(|e| Error::Other(e.to_string()))?;

        for key in self.store.keys_matching(keys::METRICS_PATTERN).await? {
            let stale = match self.store.get_json::<MetricRecord>(&key).await {
                Ok(Some(record)) => now - record.recorded_at() > metrics_retention,
                Ok(None) => continue,
                Err(e) if e.is_transient() => {
                    warn!(key = %key, "Skipping metric during cleanup: {}", e);
                    continue;
                }
                Err(_) => true,
            };
            if stale && self.delete_logged(&key).await {
                report.metrics_cleaned += 1;
            }
        }

        for key in self.store.keys_matching(keys::PROGRESS_PATTERN).await? {
            let Some(subject_id) = keys::subject_of_progress(&key) else {
                continue;
            };
            let stale = match self.store.get_json::<ProgressState>(&key).await {
                Ok(Some(progress)) => {
                    let expired = progress
                        .last_processed_at
                        .is_some_and(|at| now - at > progress_retention);
                    expired || self.is_orphaned(subject_id).await
                }
                Ok(None) => continue,
                Err(e) if e.is_transient() => {
                    warn!(key = %key, "Skipping progress during cleanup: {}", e);
                    continue;
                }
                Err(_) => true,
            };
            if stale && self.delete_logged(&key).await {
                report.progress_cleaned += 1;
            }
        }

        info!(
            metrics_cleaned = report.metrics_cleaned,
            progress_cleaned = report.progress_cleaned,
            "Cleanup completed"
        );
        Ok(report)
    }

    async fn is_orphaned(&self, subject_id: &str) -> bool {
        let active = matches!(
            self.store.get_json::<ScheduleMetadata>(&keys::schedule(subject_id)).await,
            Ok(Some(metadata)) if metadata.is_active()
        );
        if active {
            return false;
        }
        matches!(self.store.exists(&keys::chunks(subject_id)).await, Ok(false))
    }

    async fn delete_logged(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key, "Failed to delete during cleanup: {}", e);
                false
            }
        }
    }
}
