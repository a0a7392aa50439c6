//! End-to-end HTTP surface tests against the in-memory store/bus doubles —
//! no live Postgres required (spec.md §7 "Test tooling").

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use coremachine_bus::InMemoryBus;
use coremachine_http::router;
use coremachine_orchestration::Core;
use coremachine_shared::config::CoreConfig;
use coremachine_shared::errors::CoreResult;
use coremachine_shared::identity::Digest256;
use coremachine_shared::model::{Task, TaskResult};
use coremachine_shared::registry::RegistryBuilder;
use coremachine_shared::workflow::{AggregationContext, JobDefinition, TaskHandler, TaskSpec};
use coremachine_store::InMemoryStore;
use serde_json::{json, Value};
use tower::ServiceExt;

struct EchoJob;

#[async_trait]
impl JobDefinition for EchoJob {
    fn job_type(&self) -> &str {
        "echo"
    }
    fn total_stages(&self) -> i32 {
        1
    }
    fn validate_parameters(&self, raw: &Value) -> CoreResult<Value> {
        Ok(raw.clone())
    }
    async fn create_tasks_for_stage(
        &self,
        _stage: i32,
        params: &Value,
        _job_id: Digest256,
        _previous_results: &[Task],
    ) -> CoreResult<Vec<TaskSpec>> {
        Ok(vec![TaskSpec::new("only", "echo_handler", params.clone())])
    }
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<Value> {
        Ok(json!({"echoed": context.tasks[0].result_data}))
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo_handler"
    }
    async fn handle(&self, _task_id: Digest256, parameters: &Value) -> TaskResult {
        TaskResult::ok(parameters.clone())
    }
}

fn test_core() -> Core {
    let registries = RegistryBuilder::new().job(EchoJob).handler(EchoHandler).build();
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    Core::new(registries, store, bus, CoreConfig::default())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_unknown_job_type_returns_400() {
    let app = router(test_core());
    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"job_type": "nonexistent", "parameters": {}}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_for_unknown_job_id_returns_404() {
    let app = router(test_core());
    let job_id = "0".repeat(64);
    let request = Request::builder()
        .uri(format!("/jobs/{job_id}"))
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_for_malformed_job_id_returns_400() {
    let app = router(test_core());
    let request = Request::builder()
        .uri("/jobs/not-hex")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_known_job_type_returns_202_with_job_id() {
    let app = router(test_core());
    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from(json!({"job_type": "echo", "parameters": {"msg": "hi"}}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["idempotent"], false);
    assert_eq!(body["job_id"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn resubmitting_identical_parameters_is_idempotent() {
    let app = router(test_core());
    let make_request = || {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(json!({"job_type": "echo", "parameters": {"msg": "hi"}}).to_string()))
            .unwrap()
    };

    let first = body_json(app.clone().oneshot(make_request()).await.unwrap()).await;
    let second = body_json(app.oneshot(make_request()).await.unwrap()).await;

    assert_eq!(first["job_id"], second["job_id"]);
    assert_eq!(first["idempotent"], false);
    assert_eq!(second["idempotent"], true);
}

#[tokio::test]
async fn healthz_reports_both_dependencies_reachable() {
    let app = router(test_core());
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["healthy"], true);
    assert_eq!(body["store_reachable"], true);
    assert_eq!(body["bus_reachable"], true);
}
