//! # Reconciler (spec.md §7; Open Question 4: implemented, disabled by
//! default via `CoreConfig::reconciler.enabled`)
//!
//! A periodic sweeper, not a correctness requirement: every invariant in
//! spec.md §3 holds with the reconciler off. Its only job is to bound how
//! long a task can sit PROCESSING after its lease genuinely expired with
//! no redelivery — e.g. the worker holding it was killed outright, so
//! nothing ever calls `complete_task_and_check_stage` for it and the
//! stage it belongs to would otherwise never observe `is_last`.

use std::time::Duration;

use coremachine_shared::model::TaskResult;
use coremachine_store::StateStore;
use tracing::{info, warn};

use crate::core::Core;
use crate::stage_coordinator::StageCoordinator;

pub struct Reconciler {
    core: Core,
}

impl Reconciler {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Runs the sweep loop forever at `reconciler.poll_interval_seconds`.
    /// Callers should only spawn this when `core.config.reconciler.enabled`
    /// is `true`.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.core.config.reconciler.poll_interval_seconds);
        loop {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "reconciler sweep failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One sweep pass: finds tasks stuck in PROCESSING past
    /// `lease_max_total_seconds + grace_period_seconds` and forces them
    /// terminal as FAILED with `error_kind = "LeaseExpired"`, then runs
    /// them through the same `complete_task_and_check_stage` primitive a
    /// normal completion would, so the stage can still advance.
    pub async fn sweep(&self) -> Result<usize, coremachine_shared::CoreError> {
        let threshold_seconds = self.core.config.lease_max_total_seconds
            + self.core.config.reconciler.grace_period_seconds;
        let older_than = chrono::Utc::now() - chrono::Duration::seconds(threshold_seconds as i64);

        let stuck = self.core.guard_store(self.core.store.find_stuck_tasks(older_than)).await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        info!(count = stuck.len(), "reconciler reclaiming stuck tasks");

        for task in &stuck {
            let result = TaskResult::failure(
                "LeaseExpired",
                "task exceeded lease_max_total_seconds + grace_period_seconds with no completion",
            );

            let outcome = self
                .core
                .guard_store(self.core.store.complete_task_and_check_stage(
                    task.task_id,
                    task.parent_job_id,
                    task.stage_number,
                    result,
                    self.core.config.advisory_lock_namespace,
                ))
                .await?;

            if outcome.already_terminal {
                continue;
            }

            if outcome.is_last {
                let coordinator = StageCoordinator::new(self.core.clone());
                coordinator
                    .on_stage_complete(task.parent_job_id, task.stage_number, outcome.any_failed)
                    .await?;
            }
        }

        Ok(stuck.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coremachine_bus::InMemoryBus;
    use coremachine_shared::config::CoreConfig;
    use coremachine_shared::identity::compute_job_id;
    use coremachine_shared::model::Job;
    use coremachine_shared::registry::RegistryBuilder;
    use coremachine_store::InMemoryStore;
    use std::sync::Arc;

    fn test_core() -> Core {
        let registries = RegistryBuilder::new().build();
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        Core::new(registries, store, bus, CoreConfig::default())
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_with_nothing_stuck() {
        let core = test_core();
        let reconciler = Reconciler::new(core);
        let reclaimed = reconciler.sweep().await.unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn sweep_fails_a_task_stuck_past_the_grace_period() {
        let core = test_core();
        let job_id = compute_job_id("echo", &serde_json::json!({}));
        let job = Job::new(job_id, "echo", serde_json::json!({}), 1, None, None);
        core.store.create_job_if_absent(job).await.unwrap();

        let task_id = coremachine_shared::identity::compute_task_id(job_id, 1, "only");
        let mut task = coremachine_shared::model::Task::new(task_id, job_id, 1, "echo", serde_json::json!({}));
        task.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        core.store.create_tasks(1, vec![task]).await.unwrap();
        core.store.mark_task_processing(task_id).await.unwrap();

        let reconciler = Reconciler::new(core.clone());
        let reclaimed = reconciler.sweep().await.unwrap();
        assert_eq!(reclaimed, 1);

        let results = core.store.get_stage_results(job_id, 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind.as_deref(), Some("LeaseExpired"));
    }
}
