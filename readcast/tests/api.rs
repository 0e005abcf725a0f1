//! HTTP surface, driven through the router without binding a socket.

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{Harness, request, unbroken_text};
use readcast::api::{ApiServer, ApiServerConfig};

fn router(harness: &Harness) -> Router {
    ApiServer::new(ApiServerConfig::default(), harness.app_state()).build_router()
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn ingest_body(subject_id: &str) -> Value {
    json!({
        "text": unbroken_text(10_000),
        "subject_id": subject_id,
        "recipient": "reader@example.com",
        "processing_mode": "immediate_and_schedule",
        "immediate_chunks_count": 1,
        "schedule_type": "daily",
        "schedule_time": "09:00",
        "timezone": "UTC",
        "chunks_per_delivery": 2
    })
}

#[tokio::test]
async fn test_ingest_is_accepted_and_runs_as_task() {
    let harness = Harness::new();
    let router = router(&harness);

    let (status, body) = send(&router, Method::POST, "/api/ingest", Some(ingest_body("s1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    harness.settle().await;

    let (status, task) = send(&router, Method::GET, &format!("/api/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["kind"], "ingest");
    assert_eq!(task["status"], "succeeded");
    assert_eq!(task["result"]["status"], "scheduled");
    assert_eq!(task["result"]["total_chunks"], 3);
}

#[tokio::test]
async fn test_invalid_ingest_is_rejected_before_queueing() {
    let harness = Harness::new();
    let router = router(&harness);

    let mut body = ingest_body("s1");
    body["schedule_type"] = json!("fortnightly");
    let (status, error) = send(&router, Method::POST, "/api/ingest", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["message"].as_str().unwrap().contains("fortnightly"));

    let mut body = ingest_body("s1");
    body["text"] = json!("   ");
    let (status, _) = send(&router, Method::POST, "/api/ingest", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(harness.queue.stats().total(), 0);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let harness = Harness::new();
    let (status, body) = send(&router(&harness), Method::GET, "/api/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_schedule_lifecycle() {
    let harness = Harness::new();
    let router = router(&harness);

    let (status, _) = send(&router, Method::GET, "/api/subjects/s1/schedule", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    harness
        .ingest
        .ingest(&request("s1", unbroken_text(10_000), 1, 2))
        .await
        .unwrap();

    let (status, info) = send(&router, Method::GET, "/api/subjects/s1/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["metadata"]["status"], "active");
    assert_eq!(info["metadata"]["remaining_chunks"], 2);

    let (status, body) = send(&router, Method::DELETE, "/api/subjects/s1/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (status, _) = send(&router, Method::DELETE, "/api/subjects/s1/schedule", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_insights_and_trigger() {
    let harness = Harness::new();
    let router = router(&harness);
    harness
        .ingest
        .ingest(&request("s1", unbroken_text(10_000), 1, 1))
        .await
        .unwrap();
    harness.settle().await;

    let (status, body) = send(&router, Method::GET, "/api/subjects/s1/insights", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["insights"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/subjects/s1/trigger?chunks_per_delivery=11",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, outcome) = send(&router, Method::POST, "/api/subjects/s1/trigger", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["batch_start"], 1);
    assert_eq!(outcome["batch_end"], 2);

    let (status, _) = send(&router, Method::POST, "/api/subjects/missing/trigger", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_follows_store() {
    let harness = Harness::new();
    let router = router(&harness);

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    harness.store.set_offline(true);
    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_admin_endpoints() {
    let harness = Harness::new();
    let router = router(&harness);
    harness
        .ingest
        .ingest(&request("s1", unbroken_text(10_000), 1, 2))
        .await
        .unwrap();
    harness.settle().await;

    let (status, quota) = send(&router, Method::GET, "/api/admin/quota", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quota["usage"]["daily_requests_used"], 1);
    assert_eq!(quota["recent_usage"].as_array().unwrap().len(), 1);

    let (status, metrics) = send(&router, Method::GET, "/api/admin/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["registered_jobs"], 1);
    assert_eq!(metrics["schedule_records"], 1);
    assert_eq!(metrics["progress_records"], 1);

    let (status, _) = send(&router, Method::POST, "/api/admin/cleanup", None).await;
    assert_eq!(status, StatusCode::OK);

    // No logging handle is attached outside the binary.
    let (status, _) = send(&router, Method::GET, "/api/admin/logging", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
