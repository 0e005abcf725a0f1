//! In-process background task queue.
//!
//! Tasks run on the tokio runtime bounded by a semaphore. Each submission
//! carries a [`RetryPolicy`]; transient failures are retried with jittered
//! exponential backoff and the concurrency permit is released while a task
//! waits to retry. Task records are kept for status queries and pruned after
//! [`TaskQueueConfig::retention`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics::ComponentHealth;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Maximum tasks executing at once.
    pub max_concurrency: usize,
    /// How long finished task records remain queryable.
    #[serde(with = "retention_secs")]
    pub retention: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

mod retention_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Retry behaviour for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Run once; failures are terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(max_ms);

        // ±25% jitter
        let jitter_range = delay_ms / 4;
        let delay_ms = if jitter_range > 0 {
            let offset = rand::random::<u64>() % (jitter_range * 2 + 1);
            (delay_ms - jitter_range).saturating_add(offset)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }
}

/// Handle to a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: String,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until the task has finished.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        // An error means the task was dropped, which also ends it.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

struct QueueInner {
    config: TaskQueueConfig,
    semaphore: Arc<Semaphore>,
    tasks: DashMap<String, TaskSnapshot>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

/// Cloneable handle to a shared task queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(TaskQueueConfig::default())
    }
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        info!(
            "Starting task queue with {} max concurrent tasks",
            config.max_concurrency
        );
        Self {
            inner: Arc::new(QueueInner {
                semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                config,
                tasks: DashMap::new(),
                tracker: TaskTracker::new(),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Submit a task. `factory` is invoked once per attempt.
    pub fn submit<F, Fut, T>(&self, kind: &str, policy: RetryPolicy, factory: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        if self.inner.cancellation_token.is_cancelled() {
            return Err(Error::Other("task queue is shut down".to_string()));
        }

        self.prune_finished();

        let id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = watch::channel(false);

        self.inner.tasks.insert(
            id.clone(),
            TaskSnapshot {
                id: id.clone(),
                kind: kind.to_string(),
                status: TaskStatus::Pending,
                attempts: 0,
                max_attempts: policy.max_attempts,
                result: None,
                error: None,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );

        debug!(task_id = %id, kind, "Task submitted");

        let inner = self.inner.clone();
        let task_id = id.clone();
        let kind = kind.to_string();
        self.inner.tracker.spawn(async move {
            run_task(&inner, &task_id, &kind, policy, factory).await;
            let _ = done_tx.send(true);
        });

        Ok(TaskHandle { id, done: done_rx })
    }

    pub fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.inner.tasks.get(task_id).map(|task| task.clone())
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.inner.tasks.iter() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation_token.is_cancelled()
    }

    /// Wait until no task is in flight, including tasks submitted by other
    /// tasks while waiting.
    pub async fn wait_idle(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    /// Drop finished records older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.inner.config.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.inner.tasks.len();
        self.inner.tasks.retain(|_, task| {
            !(task.status.is_finished() && task.finished_at.is_some_and(|at| at < cutoff))
        });
        before.saturating_sub(self.inner.tasks.len())
    }

    pub fn health(&self) -> ComponentHealth {
        if self.is_shutdown() {
            return ComponentHealth::unhealthy("task_queue", "task queue is shut down");
        }
        let stats = self.stats();
        ComponentHealth::healthy("task_queue").with_message(format!(
            "{} running, {} pending, {} failed",
            stats.running, stats.pending, stats.failed
        ))
    }

    /// Cancel pending retries and wait for running tasks to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down task queue");
        self.inner.cancellation_token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Task queue shutdown complete");
    }
}

async fn run_task<F, Fut, T>(
    inner: &QueueInner,
    task_id: &str,
    kind: &str,
    policy: RetryPolicy,
    factory: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
    T: Serialize,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let permit = tokio::select! {
            _ = inner.cancellation_token.cancelled() => {
                finish(inner, task_id, Err("task queue shut down".to_string()));
                return;
            }
            permit = inner.semaphore.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            finish(inner, task_id, Err("task queue closed".to_string()));
            return;
        };

        if let Some(mut task) = inner.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.attempts = attempt;
            task.started_at.get_or_insert_with(Utc::now);
        }

        let outcome = factory().await;
        drop(permit);

        match outcome {
            Ok(value) => {
                let result = serde_json::to_value(value).map_err(|e| e.to_string());
                if result.is_ok() {
                    debug!(task_id, kind, attempt, "Task succeeded");
                }
                finish(inner, task_id, result);
                return;
            }
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    task_id,
                    kind,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Task failed: {}, retrying in {:?}",
                    err,
                    delay
                );
                if let Some(mut task) = inner.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Pending;
                    task.error = Some(err.to_string());
                }

                tokio::select! {
                    _ = inner.cancellation_token.cancelled() => {
                        finish(inner, task_id, Err(format!("task queue shut down during retry: {err}")));
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                error!(task_id, kind, attempt, "Task failed permanently: {}", err);
                finish(inner, task_id, Err(err.to_string()));
                return;
            }
        }
    }
}

fn finish(inner: &QueueInner, task_id: &str, outcome: std::result::Result<serde_json::Value, String>) {
    if let Some(mut task) = inner.tasks.get_mut(task_id) {
        task.finished_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                task.status = TaskStatus::Succeeded;
                task.result = Some(value);
                task.error = None;
            }
            Err(message) => {
                task.status = TaskStatus::Failed;
                task.error = Some(message);
            }
        }
    }
}
