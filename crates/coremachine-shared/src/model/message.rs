use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Digest256;

/// On-the-wire payload carried by the job queue (spec.md §6).
///
/// Carries no business state; all state lives in the store (spec.md §3
/// "Ownership & lifecycle" — QueueMessages have no owner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Digest256,
    pub job_type: String,
    pub stage: i32,
    pub correlation_id: String,
}

/// On-the-wire payload carried by the task queue (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Digest256,
    pub parent_job_id: Digest256,
    pub task_type: String,
    pub stage: i32,
    pub parameters: Value,
    pub correlation_id: String,
}
