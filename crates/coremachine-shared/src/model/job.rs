use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Type;

use crate::identity::Digest256;

/// `job.status` — spec.md §3. Transitions are enforced by
/// [`crate::state_machine::JobStateMachine`], not by this enum itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// I-J2: a job in one of these states is never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One execution of a workflow (spec.md §3 "Job").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Digest256,
    pub job_type: String,
    pub parameters: Value,
    pub status: JobStatus,
    /// Current stage number, 1-indexed. I-J1: `stage <= total_stages`.
    pub stage: i32,
    /// Frozen at creation from the workflow definition.
    pub total_stages: i32,
    pub result_data: Option<Value>,
    pub error_summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub asset_id: Option<String>,
    pub cancellation_requested: bool,
}

impl Job {
    pub fn new(
        job_id: Digest256,
        job_type: impl Into<String>,
        parameters: Value,
        total_stages: i32,
        correlation_id: Option<String>,
        asset_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            job_type: job_type.into(),
            parameters,
            status: JobStatus::Queued,
            stage: 1,
            total_stages,
            result_data: None,
            error_summary: None,
            created_at: now,
            updated_at: now,
            correlation_id,
            asset_id,
            cancellation_requested: false,
        }
    }
}
