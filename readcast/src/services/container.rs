//! Service container for dependency injection.
//!
//! The ServiceContainer builds every service from an [`AppConfig`] and
//! manages the background tasks they need.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quota_limiter::QuotaManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::AppState;
use crate::config::AppConfig;
use crate::generation::{ChatCompletionsClient, GenerationService};
use crate::ingest::IngestService;
use crate::notification::{LogTransport, NotificationTransport, Notifier, WebhookTransport};
use crate::pipeline::{DeliveryPipeline, TaskQueue};
use crate::scheduler::{
    CronRegistry, Firing, MaintenanceConfig, MaintenanceScheduler, PeriodicDeliveryManager,
    ScheduleValidator,
};
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};

/// Capacity of the channel between job timers and the firing dispatcher.
const FIRING_CHANNEL_CAPACITY: usize = 256;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServiceContainer {
    pub config: AppConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub quota: Arc<QuotaManager>,
    pub pipeline: DeliveryPipeline,
    pub manager: Arc<PeriodicDeliveryManager>,
    pub ingest: Arc<IngestService>,
    pub maintenance: Arc<MaintenanceScheduler>,
    registry: Arc<CronRegistry>,
    firings: Mutex<Option<mpsc::Receiver<Firing>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build every service, opening the configured store and choosing the
    /// notification transport.
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing service container");

        let store: Arc<dyn KeyValueStore> = if config.store.is_memory() {
            warn!("Using the in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(SqliteStore::connect(&config.store.database_url).await?)
        };

        if config.generation.api_key.is_none() {
            warn!("GENERATION_API_KEY is not set; generation calls will fail");
        }
        let generator: Arc<dyn GenerationService> =
            Arc::new(ChatCompletionsClient::new(config.generation.clone()));

        let transport: Arc<dyn NotificationTransport> = match config.notification.webhook() {
            Some(webhook) => {
                info!(url = %webhook.url, "Delivering notifications via webhook");
                Arc::new(WebhookTransport::new(webhook))
            }
            None => {
                warn!("NOTIFY_WEBHOOK_URL is not set; notifications are only logged");
                Arc::new(LogTransport)
            }
        };

        Self::with_parts(config, store, generator, transport)
    }

    /// Wire the services around externally supplied infrastructure.
    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn KeyValueStore>,
        generator: Arc<dyn GenerationService>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let quota = Arc::new(QuotaManager::new(config.rate_limit.clone())?);
        let notifier = Arc::new(Notifier::new(store.clone(), transport));
        let queue = TaskQueue::new(config.worker_pool.clone());

        let pipeline = DeliveryPipeline::new(
            quota.clone(),
            generator,
            store.clone(),
            notifier,
            queue.clone(),
            config.delivery.clone(),
        );

        let (registry, firings) = CronRegistry::new(FIRING_CHANNEL_CAPACITY);
        let registry = Arc::new(registry);
        let validator = ScheduleValidator::new(config.scheduler.default_timezone()?);

        let manager = Arc::new(PeriodicDeliveryManager::new(
            store.clone(),
            registry.clone(),
            Arc::new(pipeline.clone()),
            validator,
        ));

        let ingest = Arc::new(IngestService::new(
            store.clone(),
            pipeline.clone(),
            manager.clone(),
            config.segmenter.max_chars_per_chunk,
        ));

        let maintenance = Arc::new(MaintenanceScheduler::new(
            manager.clone(),
            store.clone(),
            queue,
            MaintenanceConfig {
                interval: config.scheduler.maintenance_interval(),
            },
        ));

        info!("Service container initialized");

        Ok(Self {
            config,
            store,
            quota,
            pipeline,
            manager,
            ingest,
            maintenance,
            registry,
            firings: Mutex::new(Some(firings)),
            background: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start the firing dispatcher and maintenance, then re-register the
    /// persisted active schedules. Returns the number of resumed schedules.
    pub async fn initialize(&self) -> Result<usize> {
        info!("Initializing services");

        if let Some(firings) = self.firings.lock().take() {
            let handle = self
                .manager
                .clone()
                .run_dispatcher(firings, self.cancellation_token.child_token());
            self.background.lock().push(handle);
        }

        let resumed = self.manager.resume_active().await?;

        if !self.maintenance.is_running() {
            let handle = self.maintenance.clone().start();
            self.background.lock().push(handle);
        }

        info!(resumed, "Services initialized");
        Ok(resumed)
    }

    /// Shared state for the HTTP API.
    pub fn app_state(&self) -> AppState {
        AppState::new(self.ingest.clone(), self.pipeline.clone(), self.manager.clone())
    }

    pub fn registry(&self) -> &Arc<CronRegistry> {
        &self.registry
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop timers and maintenance, then let in-flight tasks finish.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();
        self.registry.shutdown();
        self.maintenance.stop();

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        if tokio::time::timeout(timeout, self.pipeline.queue().shutdown())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, abandoning in-flight tasks");
        }

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
