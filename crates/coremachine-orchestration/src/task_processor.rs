//! # TaskProcessor (spec.md §4.6)

use std::sync::Arc;
use std::time::Duration;

use coremachine_bus::{Delivery, LeaseGuard, MessageBus, ReceiptHandle};
use coremachine_shared::model::{TaskMessage, TaskResult};
use coremachine_shared::CoreError;
use coremachine_store::StateStore;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::core::Core;
use crate::stage_coordinator::StageCoordinator;

pub struct TaskProcessor {
    core: Core,
}

impl TaskProcessor {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Runs the consume loop forever. Intended to be spawned as one of
    /// `max_concurrent_tasks` concurrent tasks, permit-bounded by the
    /// caller's `Semaphore` (spec.md §5).
    pub async fn run(&self, queue_name: &str) {
        loop {
            let deliveries = match self
                .core
                .guard_bus(self.core.bus.receive(queue_name, 1, self.core.config.lease_duration()))
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "task bus receive failed, retrying after backoff");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            for delivery in deliveries {
                self.handle_delivery(delivery).await;
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let receipt = delivery.receipt.clone();
        let receive_count = delivery.receive_count;
        match serde_json::from_value::<TaskMessage>(delivery.payload) {
            Ok(message) => {
                if receive_count > self.core.config.bus_max_delivery_count {
                    error!(
                        task_id = %message.task_id,
                        receive_count,
                        max = self.core.config.bus_max_delivery_count,
                        "task message exceeded max delivery count, failing task"
                    );
                    let result = TaskResult::failure(
                        "BusRetryExhausted",
                        format!("redelivered {receive_count} times without completing"),
                    );
                    if let Err(e) = self.complete_and_advance(&message, result).await {
                        error!(task_id = %message.task_id, error = %e, "failed to record retry-exhausted task");
                        return;
                    }
                    self.ack(&receipt).await;
                    return;
                }
                if let Err(e) = self.run_with_lease(message.clone(), receipt.clone()).await {
                    error!(task_id = %message.task_id, error = %e, "task processing failed, message will be redelivered");
                    return;
                }
                self.ack(&receipt).await;
            }
            Err(e) => {
                error!(error = %e, "malformed TaskMessage payload, dropping");
                self.ack(&receipt).await;
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) {
        if let Err(e) = self.core.guard_bus(self.core.bus.ack(receipt)).await {
            warn!(error = %e, "failed to ack task message");
        }
    }

    /// Wraps [`TaskProcessor::process`] with a lease-renewal background
    /// task scoped to the handler's actual runtime, extending the bus
    /// visibility timeout at `lease_renewal_interval_seconds`, capped at
    /// `lease_max_total_seconds` (spec.md §4.6, §6).
    async fn run_with_lease(&self, message: TaskMessage, receipt: ReceiptHandle) -> Result<(), CoreError> {
        let guard = LeaseGuard::spawn(
            Arc::clone(&self.core.bus),
            receipt,
            self.core.config.lease_renewal_interval(),
            self.core.config.lease_duration(),
            self.core.config.lease_max_total(),
        );
        let result = self.process(&message).await;
        guard.stop();
        result
    }

    /// The 6-step algorithm (spec.md §4.6).
    async fn process(&self, message: &TaskMessage) -> Result<(), CoreError> {
        // Step 1: look up the handler.
        let Some(handler) = self.core.registries.handler(&message.task_type) else {
            error!(task_id = %message.task_id, task_type = %message.task_type, "unknown task type");
            let result = TaskResult::failure(
                "UnknownTaskType",
                format!("no handler registered for {}", message.task_type),
            );
            return self.complete_and_advance(message, result).await;
        };

        // Step 2: PROCESSING marker, doubling as the redelivery guard —
        // a task already terminal when this message arrives must not
        // re-invoke the handler (TaskHandler contract).
        let previous_status = self
            .core
            .guard_store(self.core.store.mark_task_processing(message.task_id))
            .await?;
        if previous_status.is_terminal() {
            info!(task_id = %message.task_id, "task already terminal, skipping handler for redelivered message");
            return Ok(());
        }

        // Step 3: invoke the handler, catching panics as HandlerException.
        // `AssertUnwindSafe` is sound here: the handler's own state lives
        // behind the registry's `Arc`, and a panic unwinds only the local
        // future, never leaving this process's shared state half-updated.
        let result = match std::panic::AssertUnwindSafe(handler.handle(message.task_id, &message.parameters))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => TaskResult::failure("HandlerException", "handler panicked"),
        };

        self.complete_and_advance(message, result).await
    }

    async fn complete_and_advance(&self, message: &TaskMessage, result: TaskResult) -> Result<(), CoreError> {
        // Step 4: the critical primitive.
        let outcome = self
            .core
            .guard_store(self.core.store.complete_task_and_check_stage(
                message.task_id,
                message.parent_job_id,
                message.stage,
                result,
                self.core.config.advisory_lock_namespace,
            ))
            .await?;

        if outcome.already_terminal {
            info!(task_id = %message.task_id, "task already terminal, skipping re-completion (redelivered message)");
            return Ok(());
        }

        // Step 5: dispatch to the coordinator iff this call observed the last task.
        if outcome.is_last {
            let coordinator = StageCoordinator::new(self.core.clone());
            coordinator
                .on_stage_complete(message.parent_job_id, message.stage, outcome.any_failed)
                .await?;
        }

        // Step 6: ack happens in the caller once this returns Ok.
        Ok(())
    }
}
