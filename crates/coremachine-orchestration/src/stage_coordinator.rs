//! # StageCoordinator (spec.md §4.7)
//!
//! Invoked once per stage with `(job_id, completed_stage, any_failed)` —
//! exactly once, because it is only ever reached via the `is_last == true`
//! branch of [`crate::task_processor::TaskProcessor`], which `coremachine-store`'s
//! advisory-lock primitive guarantees fires for exactly one caller per
//! `(job_id, stage)` (I-O1).

use coremachine_bus::MessageBus;
use coremachine_shared::identity::Digest256;
use coremachine_shared::model::JobMessage;
use coremachine_shared::workflow::{AggregationContext, FailurePolicy};
use coremachine_shared::CoreError;
use coremachine_store::StateStore;
use tracing::{info, warn};

use crate::core::Core;

pub struct StageCoordinator {
    core: Core,
}

impl StageCoordinator {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// The 5-step algorithm (spec.md §4.7).
    pub async fn on_stage_complete(
        &self,
        job_id: Digest256,
        completed_stage: i32,
        any_failed: bool,
    ) -> Result<(), CoreError> {
        // Step 1: read job record.
        let job = self
            .core
            .guard_store(self.core.store.get_job(job_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))?;

        if job.status.is_terminal() {
            // Already finalized by a previous pass (or cancelled mid-flight).
            return Ok(());
        }

        let Some(job_def) = self.core.registries.job(&job.job_type) else {
            warn!(job_id = %job_id, job_type = %job.job_type, "job type vanished from registry mid-run");
            return self.fail(job_id, &job.job_type, completed_stage, "job type no longer registered").await;
        };

        // Step 2: fatal stage-failure policy routes straight to the failure path.
        let fatal_failure = any_failed && job_def.stage_failure_policy() == FailurePolicy::Fatal;
        if fatal_failure || job.cancellation_requested {
            return self.finalize_failure(job_id, completed_stage, any_failed, job.cancellation_requested).await;
        }

        if completed_stage < job.total_stages {
            // Step 3: re-seed the job queue for the next stage.
            let message = JobMessage {
                job_id,
                job_type: job.job_type.clone(),
                stage: completed_stage + 1,
                correlation_id: job.correlation_id.clone().unwrap_or_default(),
            };
            let payload = serde_json::to_value(&message)?;
            self.core
                .guard_bus(self.core.bus.send(&self.core.config.job_queue_name, &payload))
                .await?;
            info!(job_id = %job_id, next_stage = completed_stage + 1, "stage complete, advancing job");
            return Ok(());
        }

        // Step 4: final stage — aggregate and finalize.
        let all_tasks = self.core.guard_store(self.core.store.get_all_terminal_tasks(job_id)).await?;
        let context = AggregationContext { job_id, tasks: all_tasks };
        let result = job_def.aggregate_results(&context)?;
        self.core.guard_store(self.core.store.complete_job(job_id, result)).await?;
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn finalize_failure(
        &self,
        job_id: Digest256,
        completed_stage: i32,
        any_failed: bool,
        cancelled: bool,
    ) -> Result<(), CoreError> {
        let job = self
            .core
            .guard_store(self.core.store.get_job(job_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))?;

        if cancelled {
            self.core
                .guard_store(
                    self.core
                        .store
                        .update_job_status(job_id, coremachine_shared::model::JobStatus::Cancelled),
                )
                .await?;
            return Ok(());
        }

        // Step 5: optional on_failure hook, then fail_job.
        let mut error_summary = serde_json::json!({
            "failing_stage": completed_stage,
            "any_failed": any_failed,
        });
        if let Some(job_def) = self.core.registries.job(&job.job_type) {
            let all_tasks = self.core.guard_store(self.core.store.get_all_terminal_tasks(job_id)).await?;
            let context = AggregationContext { job_id, tasks: all_tasks };
            if let Some(hook_summary) = job_def.on_failure(&context) {
                error_summary = hook_summary;
            }
        }
        self.core.guard_store(self.core.store.fail_job(job_id, error_summary)).await?;
        warn!(job_id = %job_id, stage = completed_stage, "job failed");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Digest256,
        _job_type: &str,
        completed_stage: i32,
        reason: &str,
    ) -> Result<(), CoreError> {
        self.core
            .guard_store(
                self.core
                    .store
                    .fail_job(job_id, serde_json::json!({"failing_stage": completed_stage, "reason": reason})),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coremachine_bus::{InMemoryBus, MessageBus};
    use coremachine_shared::config::CoreConfig;
    use coremachine_shared::errors::CoreResult;
    use coremachine_shared::identity::compute_job_id;
    use coremachine_shared::model::{Job, Task};
    use coremachine_shared::registry::RegistryBuilder;
    use coremachine_shared::workflow::{JobDefinition, TaskSpec};
    use coremachine_store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    struct TwoStageJob {
        policy: FailurePolicy,
    }

    #[async_trait]
    impl JobDefinition for TwoStageJob {
        fn job_type(&self) -> &str {
            "two_stage"
        }
        fn total_stages(&self) -> i32 {
            2
        }
        fn stage_failure_policy(&self) -> FailurePolicy {
            self.policy
        }
        fn validate_parameters(&self, raw: &serde_json::Value) -> CoreResult<serde_json::Value> {
            Ok(raw.clone())
        }
        async fn create_tasks_for_stage(
            &self,
            _stage: i32,
            _params: &serde_json::Value,
            _job_id: Digest256,
            _previous_results: &[Task],
        ) -> CoreResult<Vec<TaskSpec>> {
            Ok(vec![])
        }
        fn aggregate_results(&self, _context: &AggregationContext) -> CoreResult<serde_json::Value> {
            Ok(json!({"done": true}))
        }
    }

    fn test_core(policy: FailurePolicy) -> Core {
        let registries = RegistryBuilder::new().job(TwoStageJob { policy }).build();
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        Core::new(registries, store, bus, CoreConfig::default())
    }

    async fn seed_job(core: &Core) -> Digest256 {
        let job_id = compute_job_id("two_stage", &json!({}));
        let mut job = Job::new(job_id, "two_stage", json!({}), 2, None, None);
        job.status = coremachine_shared::model::JobStatus::Processing;
        core.store.create_job_if_absent(job).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn stage_one_of_two_republishes_to_the_job_queue_not_finalizing() {
        let core = test_core(FailurePolicy::Fatal);
        let job_id = seed_job(&core).await;

        let coordinator = StageCoordinator::new(core.clone());
        coordinator.on_stage_complete(job_id, 1, false).await.unwrap();

        let job = core.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, coremachine_shared::model::JobStatus::Processing);

        let republished = core
            .bus
            .receive(&core.config.job_queue_name, 10, std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].payload["stage"], 2);
    }

    #[tokio::test]
    async fn final_stage_aggregates_and_completes() {
        let core = test_core(FailurePolicy::Fatal);
        let job_id = seed_job(&core).await;

        let coordinator = StageCoordinator::new(core.clone());
        coordinator.on_stage_complete(job_id, 2, false).await.unwrap();

        let job = core.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, coremachine_shared::model::JobStatus::Completed);
        assert_eq!(job.result_data, Some(json!({"done": true})));
    }

    #[tokio::test]
    async fn fatal_policy_fails_the_job_on_any_failed_task() {
        let core = test_core(FailurePolicy::Fatal);
        let job_id = seed_job(&core).await;

        let coordinator = StageCoordinator::new(core.clone());
        coordinator.on_stage_complete(job_id, 1, true).await.unwrap();

        let job = core.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, coremachine_shared::model::JobStatus::Failed);
    }

    #[tokio::test]
    async fn tolerant_policy_advances_past_a_failed_stage() {
        let core = test_core(FailurePolicy::Tolerant);
        let job_id = seed_job(&core).await;

        let coordinator = StageCoordinator::new(core.clone());
        coordinator.on_stage_complete(job_id, 1, true).await.unwrap();

        let job = core.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, coremachine_shared::model::JobStatus::Processing);
    }

    #[tokio::test]
    async fn already_terminal_job_is_not_revisited() {
        let core = test_core(FailurePolicy::Fatal);
        let job_id = seed_job(&core).await;
        core.store.complete_job(job_id, json!({"first": true})).await.unwrap();

        let coordinator = StageCoordinator::new(core.clone());
        coordinator.on_stage_complete(job_id, 2, false).await.unwrap();

        let job = core.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.result_data, Some(json!({"first": true})));
    }
}
