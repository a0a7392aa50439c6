//! End-to-end scenario tests (spec.md §8 "Testable properties" and
//! Scenarios A-F), driven entirely through the public API: [`Submission`],
//! [`JobProcessor::run`], and [`TaskProcessor::run`] against the in-memory
//! store/bus doubles. No database or external queue is required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, timeout};

use coremachine::bus::{InMemoryBus, MessageBus};
use coremachine::orchestration::{Core, JobProcessor, Submission, TaskProcessor};
use coremachine::shared::config::CoreConfig;
use coremachine::shared::errors::CoreResult;
use coremachine::shared::identity::Digest256;
use coremachine::shared::model::{Job, JobStatus, Task, TaskResult};
use coremachine::shared::registry::RegistryBuilder;
use coremachine::shared::workflow::{AggregationContext, FailurePolicy, JobDefinition, TaskHandler, TaskSpec};
use coremachine::store::InMemoryStore;

/// Scenario A fixture: one stage, one task, the handler echoes its input.
struct EchoJob;

#[async_trait]
impl JobDefinition for EchoJob {
    fn job_type(&self) -> &str {
        "echo"
    }
    fn total_stages(&self) -> i32 {
        1
    }
    fn validate_parameters(&self, raw: &serde_json::Value) -> CoreResult<serde_json::Value> {
        Ok(raw.clone())
    }
    async fn create_tasks_for_stage(
        &self,
        _stage: i32,
        params: &serde_json::Value,
        _job_id: Digest256,
        _previous_results: &[Task],
    ) -> CoreResult<Vec<TaskSpec>> {
        Ok(vec![TaskSpec::new("only", "echo_handler", params.clone())])
    }
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<serde_json::Value> {
        let first = context.tasks_for_stage(1).next();
        Ok(first.and_then(|t| t.result_data.clone()).unwrap_or(serde_json::Value::Null))
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo_handler"
    }
    async fn handle(&self, _task_id: Digest256, parameters: &serde_json::Value) -> TaskResult {
        TaskResult::ok(parameters.clone())
    }
}

/// Scenario B fixture: a single stage that fans out into N independent
/// tasks, discriminated by index.
struct FanoutJob {
    width: usize,
}

#[async_trait]
impl JobDefinition for FanoutJob {
    fn job_type(&self) -> &str {
        "fanout"
    }
    fn total_stages(&self) -> i32 {
        1
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
        Ok((0..self.width)
            .map(|i| TaskSpec::new(format!("chunk_{i}"), "noop_handler", json!({"index": i})))
            .collect())
    }
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<serde_json::Value> {
        Ok(json!({"completed": context.tasks_for_stage(1).count()}))
    }
}

/// Scenario C fixture: stage 2's single task consumes stage 1's results.
struct TwoStageJob;

#[async_trait]
impl JobDefinition for TwoStageJob {
    fn job_type(&self) -> &str {
        "two_stage"
    }
    fn total_stages(&self) -> i32 {
        2
    }
    fn validate_parameters(&self, raw: &serde_json::Value) -> CoreResult<serde_json::Value> {
        Ok(raw.clone())
    }
    async fn create_tasks_for_stage(
        &self,
        stage: i32,
        _params: &serde_json::Value,
        _job_id: Digest256,
        previous_results: &[Task],
    ) -> CoreResult<Vec<TaskSpec>> {
        if stage == 1 {
            Ok(vec![
                TaskSpec::new("a", "noop_handler", json!({"n": 1})),
                TaskSpec::new("b", "noop_handler", json!({"n": 2})),
            ])
        } else {
            let sum: i64 = previous_results
                .iter()
                .filter_map(|t| t.result_data.as_ref())
                .filter_map(|v| v.get("n").and_then(|n| n.as_i64()))
                .sum();
            Ok(vec![TaskSpec::new("finalize", "sum_handler", json!({"sum": sum}))])
        }
    }
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<serde_json::Value> {
        let finalized = context.tasks_for_stage(2).next();
        Ok(finalized.and_then(|t| t.result_data.clone()).unwrap_or(serde_json::Value::Null))
    }
}

struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    fn task_type(&self) -> &str {
        "noop_handler"
    }
    async fn handle(&self, _task_id: Digest256, parameters: &serde_json::Value) -> TaskResult {
        TaskResult::ok(parameters.clone())
    }
}

struct SumHandler;

#[async_trait]
impl TaskHandler for SumHandler {
    fn task_type(&self) -> &str {
        "sum_handler"
    }
    async fn handle(&self, _task_id: Digest256, parameters: &serde_json::Value) -> TaskResult {
        TaskResult::ok(parameters.clone())
    }
}

/// Scenario F fixture: stage with enough tasks that concurrent
/// `TaskProcessor` loops race to observe the last completion.
struct RaceJob {
    width: usize,
}

#[async_trait]
impl JobDefinition for RaceJob {
    fn job_type(&self) -> &str {
        "race"
    }
    fn total_stages(&self) -> i32 {
        1
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
        Ok((0..self.width)
            .map(|i| TaskSpec::new(format!("t_{i}"), "slow_handler", json!({"i": i})))
            .collect())
    }
    fn aggregate_results(&self, context: &AggregationContext) -> CoreResult<serde_json::Value> {
        Ok(json!({"completed": context.tasks_for_stage(1).count()}))
    }
}

struct SlowHandler {
    completions: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for SlowHandler {
    fn task_type(&self) -> &str {
        "slow_handler"
    }
    async fn handle(&self, _task_id: Digest256, parameters: &serde_json::Value) -> TaskResult {
        sleep(Duration::from_millis(5)).await;
        self.completions.fetch_add(1, Ordering::SeqCst);
        TaskResult::ok(parameters.clone())
    }
}

/// Failing-handler fixture used by the tolerant/fatal policy tests.
struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    fn task_type(&self) -> &str {
        "failing_handler"
    }
    async fn handle(&self, _task_id: Digest256, _parameters: &serde_json::Value) -> TaskResult {
        TaskResult::failure("DeliberateFailure", "this handler always fails")
    }
}

struct OneStageFailJob {
    policy: FailurePolicy,
}

#[async_trait]
impl JobDefinition for OneStageFailJob {
    fn job_type(&self) -> &str {
        "one_stage_fail"
    }
    fn total_stages(&self) -> i32 {
        1
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
        Ok(vec![TaskSpec::new("only", "failing_handler", json!({}))])
    }
    fn aggregate_results(&self, _context: &AggregationContext) -> CoreResult<serde_json::Value> {
        Ok(json!({"done": true}))
    }
}

fn test_core(registries: coremachine::shared::registry::Registries) -> Core {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    Core::new(registries, store, bus, CoreConfig::default())
}

/// Spawns one `JobProcessor` and one `TaskProcessor` consume loop in the
/// background, matching the smallest legal worker topology (spec.md §5).
fn spawn_workers(core: &Core) -> Vec<tokio::task::JoinHandle<()>> {
    let job_core = core.clone();
    let job_queue = core.config.job_queue_name.clone();
    let task_core = core.clone();
    let task_queue = core.config.task_queue_name.clone();
    vec![
        tokio::spawn(async move { JobProcessor::new(job_core).run(&job_queue).await }),
        tokio::spawn(async move { TaskProcessor::new(task_core).run(&task_queue).await }),
    ]
}

async fn await_terminal(submission: &Submission, job_id: Digest256) -> Job {
    timeout(Duration::from_secs(5), async {
        loop {
            let job = submission.get_job_status(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state within the test timeout")
}

/// Scenario A: single-task job, happy path end to end.
#[tokio::test]
async fn scenario_a_echo_single_task_completes() {
    let registries = RegistryBuilder::new().job(EchoJob).handler(EchoHandler).build();
    let core = test_core(registries);
    let workers = spawn_workers(&core);

    let submission = Submission::new(core.clone());
    let outcome = submission
        .submit("echo", json!({"msg": "hello"}), None, None)
        .await
        .unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"msg": "hello"})));

    for w in workers {
        w.abort();
    }
}

/// Scenario B: a stage that fans out to many tasks; the stage only
/// finalizes once every fanned-out task is terminal (I-S1).
#[tokio::test]
async fn scenario_b_fanout_stage_completes_only_after_every_task() {
    let registries = RegistryBuilder::new()
        .job(FanoutJob { width: 6 })
        .handler(NoopHandler)
        .build();
    let core = test_core(registries);
    let workers = spawn_workers(&core);

    let submission = Submission::new(core.clone());
    let outcome = submission.submit("fanout", json!({}), None, None).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"completed": 6})));

    for w in workers {
        w.abort();
    }
}

/// Scenario C: the second stage's task consumes the first stage's
/// aggregated task results.
#[tokio::test]
async fn scenario_c_two_stage_job_passes_results_forward() {
    let registries = RegistryBuilder::new()
        .job(TwoStageJob)
        .handler(NoopHandler)
        .handler(SumHandler)
        .build();
    let core = test_core(registries);
    let workers = spawn_workers(&core);

    let submission = Submission::new(core.clone());
    let outcome = submission.submit("two_stage", json!({}), None, None).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"sum": 3})));

    for w in workers {
        w.abort();
    }
}

/// Scenario D: two submissions with identical `(job_type, parameters)`
/// resolve to the same `job_id` and only the first publishes a message
/// (I-I1, "idempotent submission").
#[tokio::test]
async fn scenario_d_identical_submissions_are_idempotent() {
    let registries = RegistryBuilder::new().job(EchoJob).handler(EchoHandler).build();
    let core = test_core(registries);
    let submission = Submission::new(core.clone());

    let first = submission
        .submit("echo", json!({"msg": "dup"}), None, None)
        .await
        .unwrap();
    let second = submission
        .submit("echo", json!({"msg": "dup"}), None, None)
        .await
        .unwrap();

    assert_eq!(first.job_id, second.job_id);
    assert!(!first.idempotent);
    assert!(second.idempotent);

    let workers = spawn_workers(&core);
    let job = await_terminal(&submission, first.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    for w in workers {
        w.abort();
    }
}

/// Scenario E: a redelivered task message must not re-invoke the handler
/// nor double-count toward stage completion (I-O1 observed through the
/// public surface — the job still reaches exactly one Completed state).
#[tokio::test]
async fn scenario_e_redelivered_task_message_is_a_no_op_end_to_end() {
    let calls = Arc::new(AtomicUsize::new(0));
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl TaskHandler for CountingHandler {
        fn task_type(&self) -> &str {
            "echo_handler"
        }
        async fn handle(&self, _task_id: Digest256, parameters: &serde_json::Value) -> TaskResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TaskResult::ok(parameters.clone())
        }
    }

    let registries = RegistryBuilder::new()
        .job(EchoJob)
        .handler(CountingHandler { calls: Arc::clone(&calls) })
        .build();
    let core = test_core(registries);
    let submission = Submission::new(core.clone());
    let outcome = submission.submit("echo", json!({"msg": "once"}), None, None).await.unwrap();

    // Only the JobProcessor loop runs so the test controls task delivery
    // directly: peek the fanned-out TaskMessage, nack it back onto the
    // queue (simulating at-least-once redelivery), then duplicate the
    // payload so two literal copies of the same task are queued before
    // any TaskProcessor starts consuming.
    let job_core = core.clone();
    let job_queue = core.config.job_queue_name.clone();
    let job_worker = tokio::spawn(async move { JobProcessor::new(job_core).run(&job_queue).await });

    let delivery = timeout(Duration::from_secs(5), async {
        loop {
            let mut pending = core
                .bus
                .receive(&core.config.task_queue_name, 10, Duration::from_secs(30))
                .await
                .unwrap();
            if let Some(d) = pending.pop() {
                return d;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task was never fanned out");

    core.bus.send(&core.config.task_queue_name, &delivery.payload).await.unwrap();
    core.bus.nack(&delivery.receipt, true).await.unwrap();

    let task_core = core.clone();
    let task_queue = core.config.task_queue_name.clone();
    let task_worker = tokio::spawn(async move { TaskProcessor::new(task_core).run(&task_queue).await });

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    // Give the duplicate delivery a moment to drain through the running
    // TaskProcessor after the job already reports terminal.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "handler invoked exactly once despite redelivery");

    job_worker.abort();
    task_worker.abort();
}

/// Scenario F: many tasks in one stage, multiple concurrent
/// `TaskProcessor` loops racing to complete the last one. Exactly one
/// `on_stage_complete` call must fire regardless of the race (I-O1), and
/// the job reaches Completed exactly once.
#[tokio::test]
async fn scenario_f_concurrent_task_processors_observe_exactly_one_last_task() {
    let completions = Arc::new(AtomicUsize::new(0));
    let registries = RegistryBuilder::new()
        .job(RaceJob { width: 20 })
        .handler(SlowHandler { completions: Arc::clone(&completions) })
        .build();
    let core = test_core(registries);

    let job_core = core.clone();
    let job_queue = core.config.job_queue_name.clone();
    let job_worker = tokio::spawn(async move { JobProcessor::new(job_core).run(&job_queue).await });

    let mut task_workers = Vec::new();
    for _ in 0..4 {
        let task_core = core.clone();
        let task_queue = core.config.task_queue_name.clone();
        task_workers.push(tokio::spawn(async move {
            TaskProcessor::new(task_core).run(&task_queue).await
        }));
    }

    let submission = Submission::new(core.clone());
    let outcome = submission.submit("race", json!({}), None, None).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"completed": 20})));
    assert_eq!(completions.load(Ordering::SeqCst), 20, "every task runs exactly once under concurrent consumers");

    job_worker.abort();
    for w in task_workers {
        w.abort();
    }
}

/// Stage failure policy observed end to end: Fatal fails the whole job,
/// Tolerant still completes it.
#[tokio::test]
async fn fatal_policy_fails_the_job_end_to_end() {
    let registries = RegistryBuilder::new()
        .job(OneStageFailJob { policy: FailurePolicy::Fatal })
        .handler(FailingHandler)
        .build();
    let core = test_core(registries);
    let workers = spawn_workers(&core);

    let submission = Submission::new(core.clone());
    let outcome = submission.submit("one_stage_fail", json!({}), None, None).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);

    for w in workers {
        w.abort();
    }
}

#[tokio::test]
async fn tolerant_policy_still_completes_the_job_end_to_end() {
    let registries = RegistryBuilder::new()
        .job(OneStageFailJob { policy: FailurePolicy::Tolerant })
        .handler(FailingHandler)
        .build();
    let core = test_core(registries);
    let workers = spawn_workers(&core);

    let submission = Submission::new(core.clone());
    let outcome = submission.submit("one_stage_fail", json!({}), None, None).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    for w in workers {
        w.abort();
    }
}

/// Cancellation requested mid-flight halts the job before its next stage.
#[tokio::test]
async fn cancellation_requested_between_stages_halts_the_job() {
    let registries = RegistryBuilder::new()
        .job(TwoStageJob)
        .handler(NoopHandler)
        .handler(SumHandler)
        .build();
    let core = test_core(registries);
    let submission = Submission::new(core.clone());
    let outcome = submission.submit("two_stage", json!({}), None, None).await.unwrap();

    // Run the job+task processors just long enough to clear stage 1, then
    // request cancellation before stage 2 is planned.
    let workers = spawn_workers(&core);
    timeout(Duration::from_secs(5), async {
        loop {
            let job = submission.get_job_status(outcome.job_id).await.unwrap();
            if job.stage >= 1 && job.status == JobStatus::Processing {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .ok();
    submission.request_cancellation(outcome.job_id).await.unwrap();

    let job = await_terminal(&submission, outcome.job_id).await;
    assert!(matches!(job.status, JobStatus::Cancelled | JobStatus::Completed));

    for w in workers {
        w.abort();
    }
}
