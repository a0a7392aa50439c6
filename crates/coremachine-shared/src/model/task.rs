use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Type;

use crate::identity::Digest256;

/// `task.status` — spec.md §3. I-T1: monotonic, no back-transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A single unit of work dispatched to a handler (spec.md §3 "Task").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Digest256,
    pub parent_job_id: Digest256,
    pub stage_number: i32,
    pub task_type: String,
    pub parameters: Value,
    pub status: TaskStatus,
    pub result_data: Option<Value>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    /// Delivery count (spec.md §7); tracked for observability even though
    /// the bus itself disables native retry (`bus_max_delivery_count = 1`).
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_id: Digest256,
        parent_job_id: Digest256,
        stage_number: i32,
        task_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            task_id,
            parent_job_id,
            stage_number,
            task_type: task_type.into(),
            parameters,
            status: TaskStatus::Queued,
            result_data: None,
            error_kind: None,
            error_detail: None,
            attempts: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// The tagged value a `TaskHandler` returns (spec.md §4.8): `{success,
/// result_data, error?}`. Also used as the input to
/// `complete_task_and_check_stage` (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub result_data: Value,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

impl TaskResult {
    pub fn ok(result_data: Value) -> Self {
        Self {
            success: true,
            result_data,
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn failure(error_kind: impl Into<String>, error_detail: impl Into<String>) -> Self {
        Self {
            success: false,
            result_data: Value::Null,
            error_kind: Some(error_kind.into()),
            error_detail: Some(error_detail.into()),
        }
    }

    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}
