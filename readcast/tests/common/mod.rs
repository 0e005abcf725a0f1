//! Shared fixtures for the integration tests.
//!
//! Everything runs against the in-memory store with a scripted generation
//! service, a recording transport and a registry that only fires on demand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use quota_limiter::{QuotaConfig, QuotaManager, Usage};

use readcast::api::AppState;
use readcast::domain::ProcessingMode;
use readcast::generation::{Generation, GenerationError, GenerationService};
use readcast::ingest::{IngestRequest, IngestService};
use readcast::notification::{NotificationTransport, Notifier, TransportError};
use readcast::pipeline::{DeliveryConfig, DeliveryPipeline, TaskQueue};
use readcast::scheduler::{ManualRegistry, PeriodicDeliveryManager, ScheduleValidator};
use readcast::store::MemoryStore;

pub const MAX_CHARS: usize = 4800;

/// Generation service answering from a script, then with a default insight.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generation, GenerationError>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn push(&self, result: Result<Generation, GenerationError>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn generation(content: &str) -> Generation {
    Generation {
        content: content.to_string(),
        usage: Usage {
            total_tokens: 900,
            prompt_tokens: 600,
            completion_tokens: 300,
        },
        model: "scripted".to_string(),
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        text: &str,
        _system_prompt: &str,
        _max_output_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            let preview: String = text.chars().take(8).collect();
            Ok(generation(&format!("insight about {preview}")))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject_line: String,
    pub body: String,
}

/// Transport that records messages and can be told to fail a number of sends.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn transport_type(&self) -> &'static str {
        "recording"
    }

    async fn send(
        &self,
        recipient: &str,
        subject_line: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Rejected {
                status: 503,
                body: "try again".to_string(),
            });
        }

        self.sent.lock().push(SentMessage {
            recipient: recipient.to_string(),
            subject_line: subject_line.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub transport: Arc<RecordingTransport>,
    pub notifier: Arc<Notifier>,
    pub registry: Arc<ManualRegistry>,
    pub queue: TaskQueue,
    pub pipeline: DeliveryPipeline,
    pub manager: Arc<PeriodicDeliveryManager>,
    pub ingest: Arc<IngestService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_quota(QuotaConfig::default())
    }

    pub fn with_quota(quota: QuotaConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::default());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(Notifier::new(store.clone(), transport.clone()));
        let registry = Arc::new(ManualRegistry::new());
        let queue = TaskQueue::default();

        let config = DeliveryConfig {
            upstream_backoff_ms: 1,
            notify_retry_delay_ms: 1,
            notify_max_retry_delay_ms: 5,
            ..Default::default()
        };
        let pipeline = DeliveryPipeline::new(
            Arc::new(QuotaManager::new(quota).unwrap()),
            generator.clone(),
            store.clone(),
            notifier.clone(),
            queue.clone(),
            config,
        );

        let manager = Arc::new(PeriodicDeliveryManager::new(
            store.clone(),
            registry.clone(),
            Arc::new(pipeline.clone()),
            ScheduleValidator::default(),
        ));
        let ingest = Arc::new(IngestService::new(
            store.clone(),
            pipeline.clone(),
            manager.clone(),
            MAX_CHARS,
        ));

        Self {
            store,
            generator,
            transport,
            notifier,
            registry,
            queue,
            pipeline,
            manager,
            ingest,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.ingest.clone(),
            self.pipeline.clone(),
            self.manager.clone(),
        )
    }

    /// Wait for every queued delivery and notification task.
    pub async fn settle(&self) {
        self.queue.wait_idle().await;
    }
}

/// A daily request with the given text and batch sizes.
pub fn request(subject_id: &str, text: String, immediate: i64, per_delivery: i64) -> IngestRequest {
    IngestRequest {
        text,
        subject_id: subject_id.to_string(),
        recipient: "reader@example.com".to_string(),
        processing_mode: ProcessingMode::ImmediateAndSchedule,
        immediate_chunks_count: immediate,
        schedule_type: Some("daily".to_string()),
        schedule_time: Some("09:00".to_string()),
        timezone: Some("UTC".to_string()),
        chunks_per_delivery: per_delivery,
        hours_interval: None,
    }
}

/// `len` characters without any break, so segmentation cuts at the window edge.
pub fn unbroken_text(len: usize) -> String {
    "a".repeat(len)
}
