//! # Submit / status routes (spec.md §6)

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coremachine_orchestration::{Core, Submission};
use coremachine_shared::identity::Digest256;
use coremachine_shared::model::{Job, JobStatus, Stage};
use coremachine_shared::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub job_type: String,
    pub parameters: Value,
    pub correlation_id: Option<String>,
    pub asset_id: Option<String>,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: Digest256,
    pub status: JobStatus,
    pub idempotent: bool,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Digest256,
    pub job_type: String,
    pub status: JobStatus,
    pub stage: i32,
    pub total_stages: i32,
    pub result_data: Option<Value>,
    pub error_summary: Option<Value>,
    pub correlation_id: Option<String>,
    pub asset_id: Option<String>,
    /// The materialized summary row for `stage`, if that stage has been
    /// planned yet.
    pub current_stage: Option<Stage>,
}

impl JobStatusResponse {
    fn from_job_and_stage(job: Job, current_stage: Option<Stage>) -> Self {
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            status: job.status,
            stage: job.stage,
            total_stages: job.total_stages,
            result_data: job.result_data,
            error_summary: job.error_summary,
            correlation_id: job.correlation_id,
            asset_id: job.asset_id,
            current_stage,
        }
    }
}

/// Maps a [`CoreError`] to the 4xx/5xx split spec.md §7 describes:
/// validation and registry misses are the caller's fault; everything else
/// is ours.
fn error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::ValidationError { .. } | CoreError::UnknownJobType(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            error!(error = %err, "internal error serving HTTP request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

/// `POST /jobs` (spec.md §6 "Inbound: submission API").
pub async fn submit(
    State(core): State<Arc<Core>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let submission = Submission::new((*core).clone());
    match submission
        .submit(
            &request.job_type,
            request.parameters,
            request.correlation_id,
            request.asset_id,
        )
        .await
    {
        Ok(outcome) => Json(SubmitResponse {
            job_id: outcome.job_id,
            status: outcome.status,
            idempotent: outcome.idempotent,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /jobs/{job_id}` (spec.md §6 "Inbound: status query").
pub async fn get_job_status(State(core): State<Arc<Core>>, Path(job_id): Path<String>) -> Response {
    let job_id = match Digest256::from_hex(&job_id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "job_id must be 64 lowercase hex characters"})),
            )
                .into_response()
        }
    };

    let submission = Submission::new((*core).clone());
    match submission.get_job_status(job_id).await {
        Ok(job) => match submission.get_current_stage(&job).await {
            Ok(current_stage) => Json(JobStatusResponse::from_job_and_stage(job, current_stage)).into_response(),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}
