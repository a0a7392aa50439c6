//! # coremachinectl
//!
//! Operator CLI: `submit`, `status`, and `queues init`
//! (SPEC_FULL.md crate-layout table). Talks to the store/bus directly — no
//! separate HTTP round-trip is needed for an operator running alongside
//! the worker's database.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use coremachine_bus::PgmqBus;
use coremachine_orchestration::{Core, Submission};
use coremachine_shared::config::CoreConfig;
use coremachine_shared::identity::Digest256;
use coremachine_shared::registry::RegistryBuilder;
use coremachine_store::PostgresStore;

#[derive(Parser)]
#[command(name = "coremachinectl", about = "Operator CLI for the coremachine job engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and print its `job_id`.
    Submit {
        /// Registry key of the workflow.
        job_type: String,
        /// JSON object of job parameters.
        #[arg(long, default_value = "{}")]
        parameters: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Print a job's current status record.
    Status {
        /// 64-character hex job id.
        job_id: String,
    },
    /// Request cooperative cancellation of a running job.
    Cancel {
        job_id: String,
    },
    /// Operator-facing queue maintenance.
    Queues {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Create the job/task queues if they don't already exist.
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = CoreConfig::load("config").unwrap_or_default();
    let database_url = config
        .database_url
        .clone()
        .ok_or("database_url must be set (COREMACHINE__DATABASE_URL or config/base.toml)")?;

    let store = PostgresStore::connect(&database_url).await?;
    let bus = PgmqBus::from_pool(store.pool().clone());
    let registries = RegistryBuilder::new().build();
    let core = Core::new(registries, Arc::new(store), Arc::new(bus), config);

    match cli.command {
        Commands::Submit {
            job_type,
            parameters,
            correlation_id,
        } => {
            let parameters: serde_json::Value = serde_json::from_str(&parameters)?;
            let submission = Submission::new(core);
            let outcome = submission
                .submit(&job_type, parameters, correlation_id, None)
                .await?;
            println!("job_id: {}", outcome.job_id);
            println!("status: {:?}", outcome.status);
            println!("idempotent: {}", outcome.idempotent);
        }
        Commands::Status { job_id } => {
            let job_id = Digest256::from_hex(&job_id)?;
            let submission = Submission::new(core);
            let job = submission.get_job_status(job_id).await?;
            println!("job_id: {}", job.job_id);
            println!("job_type: {}", job.job_type);
            println!("status: {:?}", job.status);
            println!("stage: {}/{}", job.stage, job.total_stages);
            if let Some(current_stage) = submission.get_current_stage(&job).await? {
                println!(
                    "stage_tasks: {}/{} completed, {} failed",
                    current_stage.completed_count, current_stage.task_count, current_stage.failed_count
                );
            }
            if let Some(result) = &job.result_data {
                println!("result_data: {result}");
            }
            if let Some(error) = &job.error_summary {
                println!("error_summary: {error}");
            }
        }
        Commands::Cancel { job_id } => {
            let job_id = Digest256::from_hex(&job_id)?;
            let submission = Submission::new(core);
            submission.request_cancellation(job_id).await?;
            println!("cancellation requested for {job_id}");
        }
        Commands::Queues { command } => match command {
            QueueCommands::Init => {
                use coremachine_bus::MessageBus;
                core.bus.ensure_queue(&core.config.job_queue_name).await?;
                core.bus.ensure_queue(&core.config.task_queue_name).await?;
                println!("queues ready: {}, {}", core.config.job_queue_name, core.config.task_queue_name);
            }
        },
    }

    Ok(())
}
