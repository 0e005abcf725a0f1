//! At-most-once delivery of a chunk and its insight.
//!
//! A delivery marker is written only after a successful send. A send whose
//! marker write then fails is surfaced as [`Error::MarkerWrite`], which is not
//! transient, so the task queue never sends the same chunk twice.

use std::sync::Arc;

use dashmap::DashSet;
use serde::Serialize;
use tracing::{debug, error, info};

use super::transport::NotificationTransport;
use crate::domain::{InsightRecord, SubjectChunkSet};
use crate::store::{KeyValueStore, KeyValueStoreExt, keys, retry_transient};
use crate::{Error, Result};

pub const SUBJECT_LINE: &str = "Your Scheduled Reading Chunk";

const MARKER_VALUE: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent,
    AlreadySent,
    /// Another attempt for the same chunk is running in this process.
    InFlight,
}

pub fn compose_body(chunk_text: &str, insight_text: &str) -> String {
    format!("{chunk_text}\n\n---\nInsights:\n{insight_text}")
}

pub struct Notifier {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn NotificationTransport>,
    in_flight: Arc<DashSet<(String, usize)>>,
}

struct InFlightGuard {
    set: Arc<DashSet<(String, usize)>>,
    key: (String, usize),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

impl Notifier {
    pub fn new(store: Arc<dyn KeyValueStore>, transport: Arc<dyn NotificationTransport>) -> Self {
        Self {
            store,
            transport,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn transport_type(&self) -> &'static str {
        self.transport.transport_type()
    }

    pub async fn is_sent(&self, subject_id: &str, chunk_index: usize) -> Result<bool> {
        self.store
            .exists(&keys::delivery_marker(subject_id, chunk_index))
            .await
    }

    /// Deliver chunk `chunk_index` of `subject_id` unless it already went out.
    pub async fn notify(&self, subject_id: &str, chunk_index: usize) -> Result<NotifyOutcome> {
        let marker_key = keys::delivery_marker(subject_id, chunk_index);

        if self.store.exists(&marker_key).await? {
            debug!(subject_id, chunk_index, "Chunk already delivered, skipping");
            return Ok(NotifyOutcome::AlreadySent);
        }

        let key = (subject_id.to_string(), chunk_index);
        if !self.in_flight.insert(key.clone()) {
            debug!(subject_id, chunk_index, "Delivery already in flight");
            return Ok(NotifyOutcome::InFlight);
        }
        let _guard = InFlightGuard {
            set: self.in_flight.clone(),
            key,
        };

        // Re-check under the guard: a concurrent attempt may have finished
        // between the first check and the insert.
        if self.store.exists(&marker_key).await? {
            return Ok(NotifyOutcome::AlreadySent);
        }

        let chunk_set: SubjectChunkSet = self
            .store
            .get_json(&keys::chunks(subject_id))
            .await?
            .ok_or_else(|| Error::not_found("subject chunks", subject_id))?;

        let chunk = chunk_set.chunk(chunk_index).ok_or_else(|| {
            Error::validation(format!(
                "chunk index {chunk_index} out of range for subject {subject_id} ({} chunks)",
                chunk_set.total_chunks
            ))
        })?;

        let insights: Vec<InsightRecord> = self
            .store
            .get_json(&keys::insights(subject_id))
            .await?
            .unwrap_or_default();
        let insight_text = insights
            .iter()
            .find(|record| record.chunk_index == chunk_index)
            .map(InsightRecord::display_text)
            .unwrap_or("No insight available");

        let body = compose_body(&chunk.text, insight_text);
        self.transport
            .send(&chunk_set.recipient, SUBJECT_LINE, &body)
            .await?;

        let store = self.store.clone();
        let marker_written = retry_transient("write delivery marker", || {
            store.set_with_ttl(&marker_key, keys::SUBJECT_DATA_TTL, MARKER_VALUE)
        })
        .await;

        if let Err(e) = marker_written {
            error!(
                subject_id,
                chunk_index, "Notification sent but delivery marker could not be written: {}", e
            );
            return Err(Error::MarkerWrite(e.to_string()));
        }

        info!(
            subject_id,
            chunk_index,
            transport = self.transport.transport_type(),
            "Chunk delivered"
        );
        Ok(NotifyOutcome::Sent)
    }
}
