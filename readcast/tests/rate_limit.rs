//! Quota denials and upstream throttling end up as per-chunk error records
//! that are still delivered.

mod common;

use common::{Harness, request, unbroken_text};
use quota_limiter::QuotaConfig;
use readcast::domain::ProcessingMode;
use readcast::generation::GenerationError;

fn immediate_only(subject_id: &str, len: usize) -> readcast::ingest::IngestRequest {
    let mut req = request(subject_id, unbroken_text(len), 1, 1);
    req.processing_mode = ProcessingMode::ImmediateOnly;
    req
}

#[tokio::test]
async fn test_daily_token_limit_denies_generation() {
    // 1880 chars estimate to 500 tokens, plus 500 expected completion tokens;
    // with the 10% buffer that exceeds a 1000 token day.
    let harness = Harness::with_quota(QuotaConfig {
        daily_token_limit: 1000,
        ..Default::default()
    });

    harness
        .ingest
        .ingest(&immediate_only("s1", 1880))
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(harness.generator.calls(), 0);

    let insights = harness.pipeline.insights("s1").await.unwrap();
    assert_eq!(insights.len(), 1);
    assert!(!insights[0].is_success());
    assert_eq!(
        insights[0].error.as_deref(),
        Some("Rate limit hit: daily_token_limit_exceeded")
    );

    // The chunk still goes out, carrying the error text in place of an insight.
    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(
        sent[0]
            .body
            .ends_with("Insights:\nRate limit hit: daily_token_limit_exceeded")
    );

    let stats = harness.pipeline.quota().stats();
    assert_eq!(stats.daily_tokens_used, 0);
}

#[tokio::test]
async fn test_upstream_rate_limit_is_retried_then_recorded() {
    let harness = Harness::new();
    harness
        .generator
        .push(Err(GenerationError::RateLimited { status: 429 }));
    harness
        .generator
        .push(Err(GenerationError::RateLimited { status: 429 }));

    harness
        .ingest
        .ingest(&immediate_only("s1", 2000))
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(harness.generator.calls(), 2);
    let insights = harness.pipeline.insights("s1").await.unwrap();
    assert_eq!(insights[0].error.as_deref(), Some("HTTP 429"));
    assert_eq!(harness.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_single_upstream_rate_limit_recovers() {
    let harness = Harness::new();
    harness
        .generator
        .push(Err(GenerationError::RateLimited { status: 429 }));

    harness
        .ingest
        .ingest(&immediate_only("s1", 2000))
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(harness.generator.calls(), 2);
    let insights = harness.pipeline.insights("s1").await.unwrap();
    assert!(insights[0].is_success());

    let stats = harness.pipeline.quota().stats();
    assert_eq!(stats.daily_requests_used, 1);
    assert_eq!(stats.daily_tokens_used, 900);
}

#[tokio::test]
async fn test_generation_failure_does_not_block_other_chunks() {
    let harness = Harness::new();
    harness
        .generator
        .push(Err(GenerationError::Unavailable("upstream down".to_string())));

    let mut req = request("s1", unbroken_text(6000), 2, 1);
    req.processing_mode = ProcessingMode::ImmediateOnly;
    harness.ingest.ingest(&req).await.unwrap();
    harness.settle().await;

    let insights = harness.pipeline.insights("s1").await.unwrap();
    assert_eq!(insights.len(), 2);
    assert_eq!(insights.iter().filter(|r| r.is_success()).count(), 1);
    assert_eq!(harness.transport.sent().len(), 2);
}
