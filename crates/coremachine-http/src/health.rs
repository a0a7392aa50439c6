//! # Health endpoint
//!
//! `GET /healthz` — a lightweight store + bus reachability check: a cheap
//! query against each dependency, timed, never blocking the submit/status
//! hot path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coremachine_bus::MessageBus;
use coremachine_orchestration::Core;
use coremachine_store::StateStore;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    pub bus_reachable: bool,
    pub checked_in_ms: u64,
}

pub async fn healthz(State(core): State<Arc<Core>>) -> Response {
    let start = Instant::now();
    let timeout = Duration::from_millis(1000);

    let store_reachable = tokio::time::timeout(timeout, core.store.get_job(dummy_id()))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let bus_reachable = tokio::time::timeout(timeout, core.bus.ensure_queue(&core.config.job_queue_name))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let report = HealthReport {
        healthy: store_reachable && bus_reachable,
        store_reachable,
        bus_reachable,
        checked_in_ms: start.elapsed().as_millis() as u64,
    };

    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// A well-formed, almost-certainly-absent job id used purely to exercise
/// the store's read path without needing a real job on hand.
fn dummy_id() -> coremachine_shared::identity::Digest256 {
    coremachine_shared::identity::compute_job_id("__healthz__", &serde_json::json!({}))
}
