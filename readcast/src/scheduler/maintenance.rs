//! Periodic housekeeping.
//!
//! Each sweep removes stale metric and progress records, purges expired store
//! entries, prunes finished task records and logs overall health.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::manager::{CleanupReport, PeriodicDeliveryManager};
use crate::Result;
use crate::pipeline::TaskQueue;
use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Time between sweeps (default: 1 hour).
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cleanup: CleanupReport,
    pub expired_entries_purged: u64,
    pub task_records_pruned: usize,
}

pub struct MaintenanceScheduler {
    manager: Arc<PeriodicDeliveryManager>,
    store: Arc<dyn KeyValueStore>,
    queue: TaskQueue,
    config: MaintenanceConfig,
    running: Arc<AtomicBool>,
}

impl MaintenanceScheduler {
    pub fn new(
        manager: Arc<PeriodicDeliveryManager>,
        store: Arc<dyn KeyValueStore>,
        queue: TaskQueue,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            manager,
            store,
            queue,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick completes immediately; skip it so startup stays quiet.
        interval.tick().await;

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.run_sweep().await {
                error!("Maintenance error: {}", e);
            }
        }
    }

    pub async fn run_sweep(&self) -> Result<SweepReport> {
        info!("Starting maintenance sweep");

        let cleanup = self.manager.cleanup_expired_data().await?;

        let expired_entries_purged = match self.store.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                warn!("Failed to purge expired entries: {}", e);
                0
            }
        };

        let task_records_pruned = self.queue.prune_finished();

        let health = self.manager.health_check().await;
        if health.is_healthy() {
            info!(status = %health.status, "Health check");
        } else {
            for component in health.components.iter().filter(|c| c.message.is_some()) {
                warn!(
                    component = %component.name,
                    status = %component.status,
                    message = component.message.as_deref().unwrap_or_default(),
                    "Component not healthy"
                );
            }
        }

        let report = SweepReport {
            cleanup,
            expired_entries_purged,
            task_records_pruned,
        };
        info!(?report, "Maintenance sweep completed");
        Ok(report)
    }
}
