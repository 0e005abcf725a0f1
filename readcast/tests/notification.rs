//! Idempotent chunk notification on top of the task queue.

mod common;

use std::sync::Arc;

use common::{Harness, request, unbroken_text};
use readcast::Error;
use readcast::domain::ProcessingMode;
use readcast::notification::NotifyOutcome;
use readcast::pipeline::{BatchReport, TaskStatus};

async fn ingest_immediate(harness: &Harness, chunks: i64) -> Option<String> {
    let mut req = request("s1", unbroken_text(6000), chunks, 1);
    req.processing_mode = ProcessingMode::ImmediateOnly;
    harness.ingest.ingest(&req).await.unwrap().immediate_task_id
}

#[tokio::test]
async fn test_concurrent_notify_sends_exactly_once() {
    let harness = Harness::new();
    // Store chunks without dispatching anything.
    ingest_immediate(&harness, 0).await;

    let notifier = harness.notifier.clone();
    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let notifier = Arc::clone(&notifier);
            tokio::spawn(async move { notifier.notify("s1", 0).await })
        })
        .collect();

    let mut sent = 0;
    for attempt in attempts {
        if attempt.await.unwrap().unwrap() == NotifyOutcome::Sent {
            sent += 1;
        }
    }

    assert_eq!(sent, 1);
    assert_eq!(harness.transport.sent().len(), 1);
    assert_eq!(
        harness.notifier.notify("s1", 0).await.unwrap(),
        NotifyOutcome::AlreadySent
    );
}

#[tokio::test]
async fn test_failed_send_is_retried_by_queue() {
    let harness = Harness::new();
    harness.transport.fail_next(1);

    let task_id = ingest_immediate(&harness, 1).await.unwrap();
    harness.settle().await;

    assert_eq!(harness.transport.attempts(), 2);
    assert_eq!(harness.transport.sent().len(), 1);
    assert!(harness.notifier.is_sent("s1", 0).await.unwrap());

    let batch = harness.queue.status(&task_id).unwrap();
    assert_eq!(batch.status, TaskStatus::Succeeded);
    let report: BatchReport = serde_json::from_value(batch.result.unwrap()).unwrap();
    assert_eq!(report.notification_tasks.len(), 1);

    let notify = harness.queue.status(&report.notification_tasks[0]).unwrap();
    assert_eq!(notify.status, TaskStatus::Succeeded);
    assert_eq!(notify.attempts, 2);
}

#[tokio::test]
async fn test_send_gives_up_after_max_attempts() {
    let harness = Harness::new();
    harness.transport.fail_next(10);

    let task_id = ingest_immediate(&harness, 1).await.unwrap();
    harness.settle().await;

    let batch = harness.queue.status(&task_id).unwrap();
    let report: BatchReport = serde_json::from_value(batch.result.unwrap()).unwrap();
    let notify = harness.queue.status(&report.notification_tasks[0]).unwrap();

    assert_eq!(notify.status, TaskStatus::Failed);
    assert_eq!(notify.attempts, 3);
    assert!(notify.error.is_some());
    assert!(harness.transport.sent().is_empty());
    assert!(!harness.notifier.is_sent("s1", 0).await.unwrap());
}

#[tokio::test]
async fn test_notify_unknown_subject_is_not_found() {
    let harness = Harness::new();
    let err = harness.notifier.notify("missing", 0).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_notify_out_of_range_chunk_is_rejected() {
    let harness = Harness::new();
    ingest_immediate(&harness, 0).await;

    let err = harness.notifier.notify("s1", 5).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(harness.transport.attempts(), 0);
}
