//! # Postgres-backed state store (spec.md §4.3)
//!
//! The stage-completion primitive uses `pg_advisory_xact_lock`, a
//! transaction-scoped advisory lock released automatically on commit or
//! rollback (SPEC_FULL.md Open Question 1) — grounded on the same
//! `pg_advisory_xact_lock` pattern the pack's `adamtc007-ob-poc` advisory
//! lock module uses for "serialize a critical section without blocking
//! unrelated work".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use coremachine_shared::identity::{stage_completion_lock_key, Digest256};
use coremachine_shared::model::{Job, JobStatus, Stage, Task, TaskResult, TaskStatus};
use coremachine_shared::{CoreError, CoreResult};

use crate::traits::{CompletionOutcome, StateStore};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| CoreError::StoreTransient(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Run embedded migrations (spec.md §6 logical schema).
    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, sqlx::Error> {
    let job_id: String = row.try_get("job_id")?;
    Ok(Job {
        job_id: Digest256::from_hex(&job_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        job_type: row.try_get("job_type")?,
        parameters: row.try_get("parameters")?,
        status: row.try_get("status")?,
        stage: row.try_get("stage")?,
        total_stages: row.try_get("total_stages")?,
        result_data: row.try_get("result_data")?,
        error_summary: row.try_get("error_summary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        correlation_id: row.try_get("correlation_id")?,
        asset_id: row.try_get("asset_id")?,
        cancellation_requested: row.try_get("cancellation_requested")?,
    })
}

fn row_to_stage(row: &sqlx::postgres::PgRow) -> Result<Stage, sqlx::Error> {
    let job_id: String = row.try_get("job_id")?;
    Ok(Stage {
        job_id: Digest256::from_hex(&job_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        stage_number: row.try_get("stage_number")?,
        task_count: row.try_get("task_count")?,
        completed_count: row.try_get("completed_count")?,
        failed_count: row.try_get("failed_count")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        results_summary: row.try_get("results_summary")?,
    })
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, sqlx::Error> {
    let task_id: String = row.try_get("task_id")?;
    let parent_job_id: String = row.try_get("parent_job_id")?;
    Ok(Task {
        task_id: Digest256::from_hex(&task_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        parent_job_id: Digest256::from_hex(&parent_job_id)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        stage_number: row.try_get("stage")?,
        task_type: row.try_get("task_type")?,
        parameters: row.try_get("parameters")?,
        status: row.try_get("status")?,
        result_data: row.try_get("result_data")?,
        error_kind: row.try_get("error_kind")?,
        error_detail: row.try_get("error_detail")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn create_job_if_absent(&self, job: Job) -> CoreResult<(Job, bool)> {
        let job_id = job.job_id.to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, job_type, status, stage, total_stages, parameters,
                               correlation_id, asset_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(&job_id)
        .bind(&job.job_type)
        .bind(job.status)
        .bind(job.stage)
        .bind(job.total_stages)
        .bind(&job.parameters)
        .bind(&job.correlation_id)
        .bind(&job.asset_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            Ok((job, true))
        } else {
            let existing = self
                .get_job(job.job_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("job {job_id} vanished after conflict")))?;
            Ok((existing, false))
        }
    }

    async fn get_job(&self, job_id: Digest256) -> CoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose().map_err(CoreError::from)
    }

    async fn update_job_status(&self, job_id: Digest256, status: JobStatus) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = $1, updated_at = now()
            WHERE job_id = $2 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(status)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_job_stage(&self, job_id: Digest256, stage: i32) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET stage = $1, updated_at = now()
            WHERE job_id = $2 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(stage)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_cancellation(&self, job_id: Digest256) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET cancellation_requested = TRUE, updated_at = now()
            WHERE job_id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_task_processing(&self, task_id: Digest256) -> CoreResult<TaskStatus> {
        let row = sqlx::query("SELECT status FROM tasks WHERE task_id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let previous: TaskStatus = row
            .map(|r| r.try_get("status"))
            .transpose()?
            .unwrap_or(TaskStatus::Queued);

        if previous == TaskStatus::Queued {
            sqlx::query(
                r#"
                UPDATE tasks SET status = 'PROCESSING', claimed_at = now(), attempts = attempts + 1
                WHERE task_id = $1 AND status = 'QUEUED'
                "#,
            )
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(previous)
    }

    async fn create_tasks(&self, stage: i32, tasks: Vec<Task>) -> CoreResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let job_id = tasks[0].parent_job_id;
        let task_count = tasks.len() as i32;

        let mut tx = self.pool.begin().await?;
        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, parent_job_id, stage, task_type, status, parameters, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (task_id) DO NOTHING
                "#,
            )
            .bind(task.task_id.to_string())
            .bind(task.parent_job_id.to_string())
            .bind(task.stage_number)
            .bind(&task.task_type)
            .bind(task.status)
            .bind(&task.parameters)
            .bind(task.created_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO stages (job_id, stage_number, task_count, started_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (job_id, stage_number) DO NOTHING
            "#,
        )
        .bind(job_id.to_string())
        .bind(stage)
        .bind(task_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_stage_results(&self, job_id: Digest256, stage: i32) -> CoreResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE parent_job_id = $1 AND stage = $2 AND status IN ('COMPLETED', 'FAILED')",
        )
        .bind(job_id.to_string())
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect::<Result<_, _>>().map_err(CoreError::from)
    }

    async fn get_stage(&self, job_id: Digest256, stage_number: i32) -> CoreResult<Option<Stage>> {
        let row = sqlx::query("SELECT * FROM stages WHERE job_id = $1 AND stage_number = $2")
            .bind(job_id.to_string())
            .bind(stage_number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stage).transpose().map_err(CoreError::from)
    }

    async fn get_all_terminal_tasks(&self, job_id: Digest256) -> CoreResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE parent_job_id = $1 AND status IN ('COMPLETED', 'FAILED') ORDER BY stage",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect::<Result<_, _>>().map_err(CoreError::from)
    }

    async fn complete_task_and_check_stage(
        &self,
        task_id: Digest256,
        job_id: Digest256,
        stage: i32,
        result: TaskResult,
        advisory_lock_namespace: u32,
    ) -> CoreResult<CompletionOutcome> {
        let mut tx = self.pool.begin().await?;

        // Step 1: acquire the transaction-scoped advisory lock, serializing
        // all concurrent completion attempts for this (job_id, stage).
        let lock_key = stage_completion_lock_key(job_id, stage, advisory_lock_namespace);
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *tx)
            .await?;

        let current_status: Option<TaskStatus> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = $1 FOR UPDATE")
                .bind(task_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let current_status = current_status
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id} not found")))?;

        // Step 2a: already terminal — at-most-once observable completion.
        if current_status.is_terminal() {
            let any_failed: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE parent_job_id = $1 AND stage = $2 AND status = 'FAILED')",
            )
            .bind(job_id.to_string())
            .bind(stage)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(CompletionOutcome {
                is_last: false,
                any_failed,
                already_terminal: true,
            });
        }

        // Step 2b: update the task row.
        let new_status = result.status();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1, result_data = $2, error_kind = $3, error_detail = $4, completed_at = now()
            WHERE task_id = $5
            "#,
        )
        .bind(new_status)
        .bind(&result.result_data)
        .bind(&result.error_kind)
        .bind(&result.error_detail)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        // Step 2c/2d: count terminal vs. total tasks in this stage.
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE status IN ('COMPLETED', 'FAILED')) AS terminal_count,
                count(*) AS total_count,
                count(*) FILTER (WHERE status = 'FAILED') AS failed_count
            FROM tasks WHERE parent_job_id = $1 AND stage = $2
            "#,
        )
        .bind(job_id.to_string())
        .bind(stage)
        .fetch_one(&mut *tx)
        .await?;

        let terminal_count: i64 = row.try_get("terminal_count")?;
        let total_count: i64 = row.try_get("total_count")?;
        let failed_count: i64 = row.try_get("failed_count")?;
        let is_last = terminal_count == total_count;
        let any_failed = failed_count > 0;

        sqlx::query(
            r#"
            UPDATE stages
            SET completed_count = $1, failed_count = $2,
                completed_at = CASE WHEN $3 THEN now() ELSE completed_at END
            WHERE job_id = $4 AND stage_number = $5
            "#,
        )
        .bind((terminal_count - failed_count) as i32)
        .bind(failed_count as i32)
        .bind(is_last)
        .bind(job_id.to_string())
        .bind(stage)
        .execute(&mut *tx)
        .await?;

        // Step 3: commit releases the transaction-scoped advisory lock.
        tx.commit().await?;

        Ok(CompletionOutcome {
            is_last,
            any_failed,
            already_terminal: false,
        })
    }

    async fn complete_job(&self, job_id: Digest256, result_data: Value) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'COMPLETED', result_data = $1, updated_at = now()
            WHERE job_id = $2 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(&result_data)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: Digest256, error: Value) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'FAILED', error_summary = $1, updated_at = now()
            WHERE job_id = $2 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(&error)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_stuck_tasks(&self, older_than: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'PROCESSING' AND claimed_at < $1",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect::<Result<_, _>>().map_err(CoreError::from)
    }
}
