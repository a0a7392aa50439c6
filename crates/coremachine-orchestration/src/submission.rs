//! # Submission API (spec.md §6)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use coremachine_bus::MessageBus;
use coremachine_shared::identity::{compute_job_id, Digest256};
use coremachine_shared::model::{Job, JobMessage, Stage};
use coremachine_shared::CoreError;
use coremachine_store::StateStore;
use tracing::info;

use crate::core::Core;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub job_id: Digest256,
    pub status: coremachine_shared::model::JobStatus,
    /// `true` when this call found an existing job rather than creating
    /// one — the submitter's request was itself a duplicate, not the
    /// engine's.
    pub idempotent: bool,
}

pub struct Submission {
    core: Core,
}

impl Submission {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// `submit(job_type, parameters, correlation_id?)` (spec.md §6).
    ///
    /// Computes the deterministic `job_id`, validates parameters against
    /// the registered `JobDefinition`, and inserts the job row before
    /// publishing — a crash between insert and publish leaves a QUEUED job
    /// with no in-flight message, which the reconciler (spec.md §7) is not
    /// responsible for (job-level, not task-level); a resubmission with
    /// identical parameters is always safe and simply republishes.
    pub async fn submit(
        &self,
        job_type: &str,
        parameters: Value,
        correlation_id: Option<String>,
        asset_id: Option<String>,
    ) -> Result<SubmitOutcome, CoreError> {
        let job_def = self
            .core
            .registries
            .job(job_type)
            .ok_or_else(|| CoreError::UnknownJobType(job_type.to_string()))?;

        let validated = job_def.validate_parameters(&parameters)?;

        let job_id = compute_job_id(job_type, &validated);
        let job = Job::new(
            job_id,
            job_type,
            validated,
            job_def.total_stages(),
            correlation_id.clone(),
            asset_id,
        );

        let (job, inserted) = self.core.guard_store(self.core.store.create_job_if_absent(job)).await?;

        if inserted {
            let message = JobMessage {
                job_id: job.job_id,
                job_type: job.job_type.clone(),
                stage: 1,
                correlation_id: correlation_id.unwrap_or_default(),
            };
            let payload = serde_json::to_value(&message)?;
            self.core
                .guard_bus(self.core.bus.send(&self.core.config.job_queue_name, &payload))
                .await?;
            info!(job_id = %job.job_id, job_type, "job submitted");
        } else {
            info!(job_id = %job.job_id, job_type, "submission deduplicated to existing job");
        }

        Ok(SubmitOutcome {
            job_id: job.job_id,
            status: job.status,
            idempotent: !inserted,
        })
    }

    /// `get_job_status(job_id)` (spec.md §6).
    pub async fn get_job_status(&self, job_id: Digest256) -> Result<Job, CoreError> {
        self.core
            .guard_store(self.core.store.get_job(job_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))
    }

    /// The materialized summary row for the job's current stage, if one
    /// has been planned yet (`None` before the first `JobMessage` is
    /// processed).
    pub async fn get_current_stage(&self, job: &Job) -> Result<Option<Stage>, CoreError> {
        self.core.guard_store(self.core.store.get_stage(job.job_id, job.stage)).await
    }

    /// `request_cancellation(job_id)` (spec.md §5 "Cancellation").
    /// Sets the advisory flag only; the running job/task processors are
    /// the ones that actually observe it and stop advancing.
    pub async fn request_cancellation(&self, job_id: Digest256) -> Result<(), CoreError> {
        self.core.guard_store(self.core.store.request_cancellation(job_id)).await
    }
}
