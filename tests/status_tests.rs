
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use job_worker::status::{router, StatusState};
use test_harness::{FakeRuntime, RuntimeBehavior, TestWorker};

fn create_test_app(worker: &TestWorker) -> Router {
    router(StatusState {
        engine: worker.engine.clone(),
        max_running_jobs: 16,
        worker_id: "worker-1".to_string(),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let worker = TestWorker::new(Arc::new(FakeRuntime::new(RuntimeBehavior::Exit(0))));
    let (status, body) = get_json(create_test_app(&worker), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_worker_endpoint_reports_load() {
    let worker = TestWorker::new(Arc::new(FakeRuntime::new(RuntimeBehavior::Hang)));
    let definition = worker.add_job("sleep 60", Duration::from_secs(2)).await;
    worker.engine.run_job(definition).unwrap();

    let (status, body) = get_json(create_test_app(&worker), "/api/worker").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker_id"], "worker-1");
    assert_eq!(body["running_jobs"], 1);
    assert_eq!(body["max_running_jobs"], 16);
}

#[tokio::test]
async fn test_jobs_endpoint_lists_in_flight_jobs() {
    let worker = TestWorker::new(Arc::new(FakeRuntime::new(RuntimeBehavior::Hang)));
    let (status, body) = get_json(create_test_app(&worker), "/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(Vec::new()));

    let definition = worker.add_job("sleep 60", Duration::from_millis(1500)).await;
    let id = definition.id;
    worker.engine.run_job(definition).unwrap();

    let (_, body) = get_json(create_test_app(&worker), "/api/jobs").await;
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], id.to_string());
    assert_eq!(jobs[0]["timeout"], 1.5);
    assert!(jobs[0]["started_at"].is_string());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let worker = TestWorker::new(Arc::new(FakeRuntime::new(RuntimeBehavior::Exit(0))));
    let response = create_test_app(&worker)
        .oneshot(Request::builder().uri("/api/cluster").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
