//! # In-memory state store test double (spec.md §7 test tooling)
//!
//! Mirrors [`crate::postgres::PostgresStore`]'s semantics — including the
//! "exactly one caller observes `is_last = true`" guarantee — using a
//! `std::sync::Mutex` critical section in place of `pg_advisory_xact_lock`.
//! Used by tests that don't carry the `test-db` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use coremachine_shared::identity::Digest256;
use coremachine_shared::model::{Job, JobStatus, Stage, Task, TaskResult, TaskStatus};
use coremachine_shared::{CoreError, CoreResult};

use crate::traits::{CompletionOutcome, StateStore};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Digest256, Job>,
    tasks: HashMap<Digest256, Task>,
    stages: HashMap<(Digest256, i32), Stage>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create_job_if_absent(&self, job: Job) -> CoreResult<(Job, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.jobs.get(&job.job_id) {
            Ok((existing.clone(), false))
        } else {
            inner.jobs.insert(job.job_id, job.clone());
            Ok((job, true))
        }
    }

    async fn get_job(&self, job_id: Digest256) -> CoreResult<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&job_id).cloned())
    }

    async fn update_job_status(&self, job_id: Digest256, status: JobStatus) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = status;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn set_job_stage(&self, job_id: Digest256, stage: i32) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.stage = stage;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn request_cancellation(&self, job_id: Digest256) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.cancellation_requested = true;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_task_processing(&self, task_id: Digest256) -> CoreResult<TaskStatus> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(TaskStatus::Queued);
        };
        let previous = task.status;
        if previous == TaskStatus::Queued {
            task.status = TaskStatus::Processing;
            task.attempts += 1;
        }
        Ok(previous)
    }

    async fn create_tasks(&self, stage: i32, tasks: Vec<Task>) -> CoreResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let job_id = tasks[0].parent_job_id;
        let mut inner = self.inner.lock().unwrap();
        let task_count = tasks.len() as i32;
        for task in tasks {
            inner.tasks.entry(task.task_id).or_insert(task);
        }
        inner
            .stages
            .entry((job_id, stage))
            .or_insert_with(|| Stage::new(job_id, stage, task_count));
        Ok(())
    }

    async fn get_stage_results(&self, job_id: Digest256, stage: i32) -> CoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.stage_number == stage && t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_stage(&self, job_id: Digest256, stage_number: i32) -> CoreResult<Option<Stage>> {
        Ok(self.inner.lock().unwrap().stages.get(&(job_id, stage_number)).cloned())
    }

    async fn get_all_terminal_tasks(&self, job_id: Digest256) -> CoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.stage_number);
        Ok(tasks)
    }

    async fn complete_task_and_check_stage(
        &self,
        task_id: Digest256,
        job_id: Digest256,
        stage: i32,
        result: TaskResult,
        _advisory_lock_namespace: u32,
    ) -> CoreResult<CompletionOutcome> {
        // The mutex guard held across the whole critical section plays the
        // role pg_advisory_xact_lock plays in the Postgres backend: only one
        // caller can be inside this block for the entire store at a time,
        // which trivially serializes per-(job_id, stage) completion too.
        let mut inner = self.inner.lock().unwrap();

        let already_terminal = inner
            .tasks
            .get(&task_id)
            .map(|t| t.status.is_terminal())
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id} not found")))?;

        if already_terminal {
            let any_failed = inner.tasks.values().any(|t| {
                t.parent_job_id == job_id && t.stage_number == stage && t.status == TaskStatus::Failed
            });
            return Ok(CompletionOutcome {
                is_last: false,
                any_failed,
                already_terminal: true,
            });
        }

        {
            let task = inner.tasks.get_mut(&task_id).expect("checked above");
            task.status = result.status();
            task.result_data = Some(result.result_data.clone());
            task.error_kind = result.error_kind.clone();
            task.error_detail = result.error_detail.clone();
            task.completed_at = Some(Utc::now());
        }

        let stage_tasks: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.stage_number == stage)
            .collect();
        let total_count = inner
            .stages
            .get(&(job_id, stage))
            .map(|s| s.task_count as usize)
            .unwrap_or(stage_tasks.len());
        let terminal_count = stage_tasks.iter().filter(|t| t.status.is_terminal()).count();
        let failed_count = stage_tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let any_failed = failed_count > 0;
        let is_last = terminal_count == total_count;

        if let Some(stage_row) = inner.stages.get_mut(&(job_id, stage)) {
            stage_row.completed_count = (terminal_count - failed_count) as i32;
            stage_row.failed_count = failed_count as i32;
            if is_last {
                stage_row.completed_at = Some(Utc::now());
            }
        }

        Ok(CompletionOutcome {
            is_last,
            any_failed,
            already_terminal: false,
        })
    }

    async fn complete_job(&self, job_id: Digest256, result_data: Value) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Completed;
                job.result_data = Some(result_data);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Digest256, error: Value) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error_summary = Some(error);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn find_stuck_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        // `Task` doesn't carry a `claimed_at` field (only the Postgres
        // schema does, as a query-only column); `created_at` is close
        // enough for a reconciler test double.
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing && t.created_at < older_than)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coremachine_shared::identity::{compute_job_id, compute_task_id};
    use serde_json::json;

    fn make_job() -> Job {
        let job_id = compute_job_id("echo", &json!({"a": 1}));
        Job::new(job_id, "echo", json!({"a": 1}), 1, None, None)
    }

    #[tokio::test]
    async fn create_job_if_absent_is_idempotent() {
        let store = InMemoryStore::new();
        let job = make_job();
        let (first, inserted_first) = store.create_job_if_absent(job.clone()).await.unwrap();
        let (second, inserted_second) = store.create_job_if_absent(job).await.unwrap();
        assert!(inserted_first);
        assert!(!inserted_second);
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn completed_job_status_is_frozen() {
        let store = InMemoryStore::new();
        let job = make_job();
        store.create_job_if_absent(job.clone()).await.unwrap();
        store.complete_job(job.job_id, json!({"ok": true})).await.unwrap();
        store.update_job_status(job.job_id, JobStatus::Processing).await.unwrap();
        let reloaded = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn exactly_one_caller_observes_is_last() {
        let store = InMemoryStore::new();
        let job = make_job();
        let t1 = Task::new(
            compute_task_id(job.job_id, 1, "a"),
            job.job_id,
            1,
            "echo.unit",
            json!({}),
        );
        let t2 = Task::new(
            compute_task_id(job.job_id, 1, "b"),
            job.job_id,
            1,
            "echo.unit",
            json!({}),
        );
        store
            .create_tasks(1, vec![t1.clone(), t2.clone()])
            .await
            .unwrap();

        let r1 = store
            .complete_task_and_check_stage(t1.task_id, job.job_id, 1, TaskResult::ok(json!({})), 0)
            .await
            .unwrap();
        let r2 = store
            .complete_task_and_check_stage(t2.task_id, job.job_id, 1, TaskResult::ok(json!({})), 0)
            .await
            .unwrap();

        assert_ne!(r1.is_last, r2.is_last);
        assert!(r1.is_last || r2.is_last);
    }

    #[tokio::test]
    async fn redelivered_completion_is_a_no_op() {
        let store = InMemoryStore::new();
        let job = make_job();
        let t1 = Task::new(compute_task_id(job.job_id, 1, "a"), job.job_id, 1, "echo.unit", json!({}));
        store.create_tasks(1, vec![t1.clone()]).await.unwrap();

        let first = store
            .complete_task_and_check_stage(t1.task_id, job.job_id, 1, TaskResult::ok(json!({})), 0)
            .await
            .unwrap();
        let second = store
            .complete_task_and_check_stage(t1.task_id, job.job_id, 1, TaskResult::ok(json!({})), 0)
            .await
            .unwrap();

        assert!(first.is_last);
        assert!(!second.is_last);
        assert!(second.already_terminal);
    }
}
