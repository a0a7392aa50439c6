//! # coremachine-http
//!
//! The HTTP trigger surface (spec.md §6, explicitly in scope per §1's
//! carve-out): `POST /jobs`, `GET /jobs/{job_id}`, `GET /healthz`. Thin by
//! design — every request is a store-write plus a bus-publish, or a
//! store-read; all orchestration semantics live in
//! `coremachine-orchestration`.

mod health;
mod routes;

use std::sync::Arc;

use axum::Router;
use coremachine_orchestration::Core;

pub use health::HealthReport;
pub use routes::{JobStatusResponse, SubmitRequest, SubmitResponse};

/// Builds the axum [`Router`] serving the endpoints in spec.md §6. `core`
/// is cloned into each handler's state the way every other
/// `coremachine-*` consumer shares it — cheap because every field behind
/// it is an `Arc`.
pub fn router(core: Core) -> Router {
    Router::new()
        .route("/jobs", axum::routing::post(routes::submit))
        .route("/jobs/{job_id}", axum::routing::get(routes::get_job_status))
        .route("/healthz", axum::routing::get(health::healthz))
        .with_state(Arc::new(core))
}
