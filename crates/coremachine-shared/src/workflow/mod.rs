//! # Workflow contract (spec.md §4.8)
//!
//! `JobDefinition` and `TaskHandler` are explicit traits, not duck-typed
//! attribute lookups (spec.md §9 "Duck-typed workflow definitions").
//! Implementors are registered once at startup via
//! [`crate::registry::Core`] and never looked up by any other mechanism.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::CoreResult;
use crate::model::{Task, TaskResult};

/// Per-workflow policy for a stage containing at least one FAILED task
/// (spec.md §7 "Stage failure policy is per-workflow"; Open Question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Job transitions to FAILED when any task in a completed stage failed.
    #[default]
    Fatal,
    /// Proceed to the next stage with partial results.
    Tolerant,
}

/// One task to create for a stage, returned by
/// [`JobDefinition::create_tasks_for_stage`].
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Workflow-chosen stable string fed into `compute_task_id` — e.g.
    /// `"chunk_7"`, `"finalize"` (spec.md §4.1).
    pub discriminator: String,
    pub task_type: String,
    pub parameters: Value,
}

impl TaskSpec {
    pub fn new(
        discriminator: impl Into<String>,
        task_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            discriminator: discriminator.into(),
            task_type: task_type.into(),
            parameters,
        }
    }
}

/// Context handed to [`JobDefinition::aggregate_results`] and the failure
/// path's optional `on_failure` hook: every terminal task record across
/// all stages of the job, plus the stage at which aggregation is running.
#[derive(Debug, Clone)]
pub struct AggregationContext {
    pub job_id: crate::identity::Digest256,
    pub tasks: Vec<Task>,
}

impl AggregationContext {
    pub fn tasks_for_stage(&self, stage: i32) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.stage_number == stage)
    }
}

/// The declarative description of a job type (spec.md §4.8).
///
/// Implementations must be stateless pure-logic: `create_tasks_for_stage`
/// and `aggregate_results` are planning functions with no side effects;
/// I/O happens exclusively inside task handlers.
#[async_trait]
pub trait JobDefinition: Send + Sync {
    /// Registry key.
    fn job_type(&self) -> &str;

    /// Frozen into `job.total_stages` at creation.
    fn total_stages(&self) -> i32;

    /// Per-workflow stage failure policy (Open Question 2; default Fatal).
    fn stage_failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    /// Applied at submission time; rejects early before any queue traffic.
    fn validate_parameters(&self, raw: &Value) -> CoreResult<Value>;

    /// Plans a stage. For `stage > 1`, `previous_results` is the list of
    /// terminal task records from `stage - 1`. Returning an empty list is
    /// legal and fast-completes the stage.
    async fn create_tasks_for_stage(
        &self,
        stage: i32,
        params: &Value,
        job_id: crate::identity::Digest256,
        previous_results: &[Task],
    ) -> CoreResult<Vec<TaskSpec>>;

    /// Builds the final `result_data` from all terminal task records.
    /// Pure function; no side effects.
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<Value>;

    /// Optional hook invoked on the failure path before `fail_job`.
    fn on_failure(&self, _context: &AggregationContext) -> Option<Value> {
        None
    }
}

/// A pure-contract function that executes one task (spec.md §4.8).
///
/// Implementations must be idempotent with respect to external side
/// effects (spec.md §7); the core only guarantees that it will not
/// re-invoke the handler for a task already observed terminal (spec.md
/// §4.6 step 4).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registry key.
    fn task_type(&self) -> &str;

    async fn handle(&self, task_id: crate::identity::Digest256, parameters: &Value) -> TaskResult;
}
