//! # State store contract (spec.md §4.3)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use coremachine_shared::identity::Digest256;
use coremachine_shared::model::{Job, JobStatus, Stage, Task, TaskResult, TaskStatus};
use coremachine_shared::CoreResult;

/// Output of `complete_task_and_check_stage` (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// `true` iff this call observed the stage's last task turn terminal.
    /// I-O1: across any concurrent callers, exactly one outcome for a
    /// given `(job_id, stage)` has `is_last = true`.
    pub is_last: bool,
    pub any_failed: bool,
    /// `true` if the task was already terminal when this call arrived
    /// (a redelivered message); when set, `is_last` is always `false` and
    /// no row was re-completed (spec.md §4.3 step 2a).
    pub already_terminal: bool,
}

/// Persists job/stage/task records and exposes the atomic stage-completion
/// primitive (spec.md §4.3). Implemented by a Postgres-backed store
/// ([`crate::postgres::PostgresStore`]) and an in-memory test double
/// ([`crate::in_memory::InMemoryStore`]) that obey identical semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Inserts a new job. On a primary-key conflict, returns the existing
    /// record instead (idempotent submission) — the bool is `true` when a
    /// new row was actually inserted.
    async fn create_job_if_absent(&self, job: Job) -> CoreResult<(Job, bool)>;

    async fn get_job(&self, job_id: Digest256) -> CoreResult<Option<Job>>;

    /// Conditional update enforcing I-J2 (terminal states are frozen).
    /// No-ops (without error) if the job is already terminal.
    async fn update_job_status(&self, job_id: Digest256, status: JobStatus) -> CoreResult<()>;

    async fn set_job_stage(&self, job_id: Digest256, stage: i32) -> CoreResult<()>;

    async fn request_cancellation(&self, job_id: Digest256) -> CoreResult<()>;

    /// Marks a task PROCESSING (spec.md §4.6 step 2) and reports the
    /// status it held *before* this call — a no-op when the task wasn't
    /// QUEUED. `TaskProcessor` uses the returned status to skip
    /// re-invoking the handler for a task a previous delivery already
    /// drove to completion, honoring the `TaskHandler` contract that a
    /// handler is never re-invoked for an already-terminal task; it also
    /// feeds [`StateStore::find_stuck_tasks`].
    async fn mark_task_processing(&self, task_id: Digest256) -> CoreResult<TaskStatus>;

    /// Bulk insert; PK conflicts silently ignored (idempotent under
    /// job-message redelivery). Also materializes the stage's summary row
    /// with `task_count = tasks.len()`.
    async fn create_tasks(&self, stage: i32, tasks: Vec<Task>) -> CoreResult<()>;

    /// Terminal-state task records for `(job_id, stage)` — used by
    /// next-stage planning and job finalization.
    async fn get_stage_results(&self, job_id: Digest256, stage: i32) -> CoreResult<Vec<Task>>;

    /// The materialized summary row for `(job_id, stage)` — status-query
    /// surfaces read this instead of recomputing counts from `tasks`.
    async fn get_stage(&self, job_id: Digest256, stage_number: i32) -> CoreResult<Option<Stage>>;

    /// Terminal-state task records across every stage of the job — used
    /// by `JobDefinition::aggregate_results`.
    async fn get_all_terminal_tasks(&self, job_id: Digest256) -> CoreResult<Vec<Task>>;

    /// The critical primitive (spec.md §4.3): acquire the
    /// `hash(job_id, stage)` advisory lock, transition the task to a
    /// terminal state if it isn't already, count terminal vs. total tasks
    /// in the stage, and report whether this call observed the last one.
    async fn complete_task_and_check_stage(
        &self,
        task_id: Digest256,
        job_id: Digest256,
        stage: i32,
        result: TaskResult,
        advisory_lock_namespace: u32,
    ) -> CoreResult<CompletionOutcome>;

    /// Sets COMPLETED with result, guarded by I-J2.
    async fn complete_job(&self, job_id: Digest256, result_data: Value) -> CoreResult<()>;

    /// Sets FAILED with error, guarded by I-J2.
    async fn fail_job(&self, job_id: Digest256, error: Value) -> CoreResult<()>;

    /// Tasks still PROCESSING with no completion recorded since before
    /// `older_than` — input to the reconciler (spec.md §7).
    async fn find_stuck_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<Task>>;
}
