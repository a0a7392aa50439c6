use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Digest256;

/// A specific stage instance within a job (spec.md §3 "Stage").
///
/// Identified by `(job_id, stage_number)`. `stages` is an optional
/// materialized-summary table per spec.md §6 — `completed_count` /
/// `failed_count` can always be recomputed from `tasks`, but keeping a
/// summary row avoids a full scan on every status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub job_id: Digest256,
    pub stage_number: i32,
    pub task_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results_summary: Option<Value>,
}

impl Stage {
    pub fn new(job_id: Digest256, stage_number: i32, task_count: i32) -> Self {
        Self {
            job_id,
            stage_number,
            task_count,
            completed_count: 0,
            failed_count: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            results_summary: None,
        }
    }

    /// I-S1: a stage is complete iff every one of its tasks is terminal.
    pub fn is_complete(&self) -> bool {
        self.completed_count + self.failed_count == self.task_count
    }

    pub fn any_failed(&self) -> bool {
        self.failed_count > 0
    }
}
