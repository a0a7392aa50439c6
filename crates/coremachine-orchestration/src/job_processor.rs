//! # JobProcessor (spec.md §4.5)

use std::time::Duration;

use coremachine_bus::{Delivery, MessageBus, ReceiptHandle};
use coremachine_shared::identity::compute_task_id;
use coremachine_shared::model::{Job, JobMessage, JobStatus, Task, TaskMessage};
use coremachine_shared::CoreError;
use coremachine_store::StateStore;
use tracing::{error, info, warn};

use crate::core::Core;
use crate::stage_coordinator::StageCoordinator;

pub struct JobProcessor {
    core: Core,
}

impl JobProcessor {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Runs the consume loop forever. Intended to be spawned as one of
    /// `max_concurrent_jobs` concurrent tasks (concurrency enforced by the
    /// caller's `Semaphore`, spec.md §5).
    pub async fn run(&self, queue_name: &str) {
        loop {
            let deliveries = match self
                .core
                .guard_bus(self.core.bus.receive(queue_name, 1, self.core.config.lease_duration()))
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "job bus receive failed, retrying after backoff");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            for delivery in deliveries {
                self.handle_delivery(queue_name, delivery).await;
            }
        }
    }

    async fn handle_delivery(&self, queue_name: &str, delivery: Delivery) {
        let receipt = delivery.receipt.clone();
        let receive_count = delivery.receive_count;
        match serde_json::from_value::<JobMessage>(delivery.payload) {
            Ok(message) => {
                if receive_count > self.core.config.bus_max_delivery_count {
                    error!(
                        job_id = %message.job_id,
                        receive_count,
                        max = self.core.config.bus_max_delivery_count,
                        "job message exceeded max delivery count, failing job"
                    );
                    if let Err(e) = self
                        .core
                        .guard_store(self.core.store.fail_job(
                            message.job_id,
                            serde_json::json!({"error_kind": "BusRetryExhausted", "receive_count": receive_count}),
                        ))
                        .await
                    {
                        error!(job_id = %message.job_id, error = %e, "failed to mark job failed after exhausting retries");
                        return;
                    }
                    self.ack(&receipt).await;
                    return;
                }
                if let Err(e) = self.process(&message).await {
                    error!(job_id = %message.job_id, error = %e, "job processing failed, message will be redelivered");
                    return;
                }
                self.ack(&receipt).await;
            }
            Err(e) => {
                error!(error = %e, "malformed JobMessage payload, dropping");
                self.ack(&receipt).await;
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) {
        if let Err(e) = self.core.guard_bus(self.core.bus.ack(receipt)).await {
            warn!(error = %e, "failed to ack job message");
        }
    }

    /// The 9-step algorithm (spec.md §4.5).
    async fn process(&self, message: &JobMessage) -> Result<(), CoreError> {
        // Step 1: look up the JobDefinition.
        let Some(job_def) = self.core.registries.job(&message.job_type) else {
            error!(job_id = %message.job_id, job_type = %message.job_type, "unknown job type");
            self.core
                .guard_store(self.core.store.fail_job(
                    message.job_id,
                    serde_json::json!({"error_kind": "UnknownJobType", "job_type": message.job_type}),
                ))
                .await?;
            return Ok(());
        };

        // Step 2: idempotent replay guard.
        let Some(job) = self.core.guard_store(self.core.store.get_job(message.job_id)).await? else {
            return Err(CoreError::NotFound(format!("job {} not found", message.job_id)));
        };
        if job.status.is_terminal() {
            info!(job_id = %message.job_id, status = ?job.status, "job already terminal, ignoring replayed message");
            return Ok(());
        }

        // Cancellation check (spec.md §5 "JobProcessor checks it before
        // planning the next stage").
        if job.cancellation_requested {
            self.core
                .guard_store(self.core.store.update_job_status(job.job_id, JobStatus::Cancelled))
                .await?;
            info!(job_id = %message.job_id, "job cancelled before stage planning");
            return Ok(());
        }

        // Step 3: mark PROCESSING, set current stage.
        self.core
            .guard_store(self.core.store.update_job_status(job.job_id, JobStatus::Processing))
            .await?;
        self.core
            .guard_store(self.core.store.set_job_stage(job.job_id, message.stage))
            .await?;

        // Step 4: load previous-stage results.
        let previous_results: Vec<Task> = if message.stage > 1 {
            self.core
                .guard_store(self.core.store.get_stage_results(job.job_id, message.stage - 1))
                .await?
        } else {
            Vec::new()
        };

        // Step 5: plan the stage.
        let specs = job_def
            .create_tasks_for_stage(message.stage, &job.parameters, job.job_id, &previous_results)
            .await?;

        if specs.is_empty() {
            // Legal fast-completion: no tasks means the stage is immediately
            // terminal with nothing to fan out.
            let coordinator = StageCoordinator::new(self.core.clone());
            coordinator.on_stage_complete(job.job_id, message.stage, false).await?;
            return Ok(());
        }

        // Step 6: compute deterministic task IDs, build records.
        let tasks: Vec<Task> = specs
            .iter()
            .map(|spec| {
                let task_id = compute_task_id(job.job_id, message.stage, &spec.discriminator);
                Task::new(task_id, job.job_id, message.stage, spec.task_type.clone(), spec.parameters.clone())
            })
            .collect();

        // Step 7: bulk insert before publishing (ordering matters: a
        // redelivered TaskMessage must always find its row already present).
        self.core
            .guard_store(self.core.store.create_tasks(message.stage, tasks.clone()))
            .await?;

        // Step 8: publish one TaskMessage per created task.
        for task in &tasks {
            let task_message = TaskMessage {
                task_id: task.task_id,
                parent_job_id: job.job_id,
                task_type: task.task_type.clone(),
                stage: message.stage,
                parameters: task.parameters.clone(),
                correlation_id: message.correlation_id.clone(),
            };
            let payload = serde_json::to_value(&task_message)?;
            self.core
                .guard_bus(self.core.bus.send(&self.core.config.task_queue_name, &payload))
                .await?;
        }

        // Step 9: ack happens in the caller once this returns Ok.
        Ok(())
    }
}

/// Constructs the initial `Job` record for submission (spec.md §6 `submit`).
pub fn new_job(
    job_id: coremachine_shared::identity::Digest256,
    job_type: &str,
    parameters: serde_json::Value,
    total_stages: i32,
    correlation_id: Option<String>,
    asset_id: Option<String>,
) -> Job {
    Job::new(job_id, job_type, parameters, total_stages, correlation_id, asset_id)
}
