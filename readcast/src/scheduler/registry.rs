//! Named recurring jobs.
//!
//! A registry owns the timers for every active schedule. When a job fires it
//! does not run the batch itself; it sends a [`Firing`] down a channel so the
//! delivery manager can process it on its own task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::trigger::TriggerSpec;
use crate::{Error, Result};

/// Arguments passed to the batch executor each time a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringArgs {
    pub subject_id: String,
    pub chunks_per_delivery: usize,
    pub start_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub job_name: String,
    pub args: FiringArgs,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredJob {
    pub name: String,
    pub expression: String,
    pub timezone: String,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Job registration backend.
///
/// Registering a name that already exists replaces the previous job, so a
/// subject never has two live triggers.
pub trait SchedulerRegistry: Send + Sync {
    fn register(&self, job_name: &str, trigger: TriggerSpec, args: FiringArgs) -> Result<()>;

    /// Returns whether a job was removed.
    fn deregister(&self, job_name: &str) -> bool;

    fn is_registered(&self, job_name: &str) -> bool;

    fn next_fire(&self, job_name: &str) -> Option<DateTime<Utc>>;

    fn registered_jobs(&self) -> Vec<RegisteredJob>;
}

struct CronJob {
    trigger: TriggerSpec,
    token: CancellationToken,
}

/// Registry that drives each job from its own tokio timer task.
pub struct CronRegistry {
    jobs: Arc<DashMap<String, CronJob>>,
    firings: mpsc::Sender<Firing>,
    cancellation_token: CancellationToken,
}

impl CronRegistry {
    /// Create a registry and the receiving end of its firing channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Firing>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let registry = Self {
            jobs: Arc::new(DashMap::new()),
            firings: tx,
            cancellation_token: CancellationToken::new(),
        };
        (registry, rx)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancel every timer. Registrations made afterwards are rejected.
    pub fn shutdown(&self) {
        info!("Shutting down cron registry ({} jobs)", self.jobs.len());
        self.cancellation_token.cancel();
        self.jobs.clear();
    }

    fn spawn_timer(&self, job_name: String, trigger: TriggerSpec, args: FiringArgs, token: CancellationToken) {
        let firings = self.firings.clone();
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            let mut last_fired = None;
            loop {
                let Some(next) = next_slot(&trigger, Utc::now(), last_fired) else {
                    warn!(job = %job_name, "Trigger has no upcoming firings, stopping timer");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                if token.is_cancelled() {
                    break;
                }

                last_fired = Some(next);
                debug!(job = %job_name, scheduled_at = %next, "Job fired");
                let firing = Firing {
                    job_name: job_name.clone(),
                    args: args.clone(),
                    scheduled_at: next,
                };
                if firings.send(firing).await.is_err() {
                    debug!(job = %job_name, "Firing channel closed, stopping timer");
                    break;
                }
            }

            // Drop our entry unless it was already replaced by a newer registration.
            jobs.remove_if(&job_name, |_, job| job.token.is_cancelled() || firings.is_closed());
        });
    }
}

/// Next slot after `now`, never at or before the slot that last fired.
///
/// The timer sleeps on the monotonic clock; a wall clock running behind it
/// would otherwise hand back the slot that just fired.
fn next_slot(
    trigger: &TriggerSpec,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let after = last_fired.map_or(now, |last| now.max(last));
    trigger.next_after(after)
}

impl SchedulerRegistry for CronRegistry {
    fn register(&self, job_name: &str, trigger: TriggerSpec, args: FiringArgs) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("cron registry is shut down".to_string()));
        }
        if trigger.next_after(Utc::now()).is_none() {
            return Err(Error::invalid_schedule(format!(
                "trigger {} never fires",
                trigger.expression()
            )));
        }

        let token = self.cancellation_token.child_token();
        let job = CronJob {
            trigger: trigger.clone(),
            token: token.clone(),
        };
        if let Some(previous) = self.jobs.insert(job_name.to_string(), job) {
            previous.token.cancel();
            debug!(job = job_name, "Replaced existing registration");
        }

        info!(
            job = job_name,
            expression = trigger.expression(),
            timezone = %trigger.timezone(),
            "Registered recurring job"
        );
        self.spawn_timer(job_name.to_string(), trigger, args, token);
        Ok(())
    }

    fn deregister(&self, job_name: &str) -> bool {
        match self.jobs.remove(job_name) {
            Some((_, job)) => {
                job.token.cancel();
                info!(job = job_name, "Deregistered recurring job");
                true
            }
            None => false,
        }
    }

    fn is_registered(&self, job_name: &str) -> bool {
        self.jobs.contains_key(job_name)
    }

    fn next_fire(&self, job_name: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .get(job_name)
            .and_then(|job| job.trigger.next_after(Utc::now()))
    }

    fn registered_jobs(&self) -> Vec<RegisteredJob> {
        let now = Utc::now();
        let mut jobs: Vec<RegisteredJob> = self
            .jobs
            .iter()
            .map(|entry| RegisteredJob {
                name: entry.key().clone(),
                expression: entry.trigger.expression().to_string(),
                timezone: entry.trigger.timezone().name().to_string(),
                next_fire: entry.trigger.next_after(now),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }
}

impl Drop for CronRegistry {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Registry without timers. Jobs only fire when [`ManualRegistry::fire`] is
/// called, which makes batch execution deterministic under test.
#[derive(Default)]
pub struct ManualRegistry {
    jobs: Mutex<HashMap<String, (TriggerSpec, FiringArgs)>>,
    registrations: Mutex<usize>,
}

impl ManualRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments the named job would fire with, if it is registered.
    pub fn fire(&self, job_name: &str) -> Option<FiringArgs> {
        self.jobs.lock().get(job_name).map(|(_, args)| args.clone())
    }

    pub fn trigger(&self, job_name: &str) -> Option<TriggerSpec> {
        self.jobs.lock().get(job_name).map(|(trigger, _)| trigger.clone())
    }

    /// Total `register` calls, replacements included.
    pub fn registration_count(&self) -> usize {
        *self.registrations.lock()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

impl SchedulerRegistry for ManualRegistry {
    fn register(&self, job_name: &str, trigger: TriggerSpec, args: FiringArgs) -> Result<()> {
        self.jobs
            .lock()
            .insert(job_name.to_string(), (trigger, args));
        *self.registrations.lock() += 1;
        Ok(())
    }

    fn deregister(&self, job_name: &str) -> bool {
        self.jobs.lock().remove(job_name).is_some()
    }

    fn is_registered(&self, job_name: &str) -> bool {
        self.jobs.lock().contains_key(job_name)
    }

    fn next_fire(&self, job_name: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .lock()
            .get(job_name)
            .and_then(|(trigger, _)| trigger.next_after(Utc::now()))
    }

    fn registered_jobs(&self) -> Vec<RegisteredJob> {
        let now = Utc::now();
        let mut jobs: Vec<RegisteredJob> = self
            .jobs
            .lock()
            .iter()
            .map(|(name, (trigger, _))| RegisteredJob {
                name: name.clone(),
                expression: trigger.expression().to_string(),
                timezone: trigger.timezone().name().to_string(),
                next_fire: trigger.next_after(now),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }
}
