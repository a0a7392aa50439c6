//! # coremachine-worker
//!
//! Thin wrapper binary: loads config, connects the store/bus adapters,
//! registers workflows, and runs the job/task consume loops plus the
//! optional reconciler until a shutdown signal arrives.

use std::sync::Arc;

use coremachine_bus::{MessageBus, PgmqBus};
use coremachine_orchestration::{Core, JobProcessor, Reconciler, TaskProcessor};
use coremachine_shared::config::CoreConfig;
use coremachine_shared::registry::RegistryBuilder;
use coremachine_store::PostgresStore;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting coremachine-worker");

    let config = CoreConfig::load("config").map_err(|e| format!("failed to load config: {e}"))?;

    let database_url = config
        .database_url
        .clone()
        .ok_or("database_url must be set")?;

    let store = PostgresStore::connect(&database_url).await?;
    store.migrate().await?;
    let bus = PgmqBus::from_pool(store.pool().clone());
    bus.ensure_queue(&config.job_queue_name).await?;
    bus.ensure_queue(&config.task_queue_name).await?;

    // Workflow/handler registration happens in one reviewable place, not
    // via decorators scattered across modules (spec.md §4.2, §9).
    let registries = RegistryBuilder::new().build();

    let core = Core::new(registries, Arc::new(store), Arc::new(bus), config.clone());

    let job_permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let task_permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));

    let mut handles = Vec::new();

    for _ in 0..config.max_concurrent_jobs {
        let core = core.clone();
        let permits = Arc::clone(&job_permits);
        let queue = core.config.job_queue_name.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire().await.expect("semaphore never closed");
            JobProcessor::new(core).run(&queue).await;
        }));
    }

    for _ in 0..config.max_concurrent_tasks {
        let core = core.clone();
        let permits = Arc::clone(&task_permits);
        let queue = core.config.task_queue_name.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire().await.expect("semaphore never closed");
            TaskProcessor::new(core).run(&queue).await;
        }));
    }

    if core.config.reconciler.enabled {
        info!("reconciler enabled, spawning sweep loop");
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            Reconciler::new(core).run().await;
        }));
    }

    info!(
        job_workers = config.max_concurrent_jobs,
        task_workers = config.max_concurrent_tasks,
        "coremachine-worker started, press Ctrl+C to shut down"
    );

    shutdown_signal().await;
    info!("shutdown signal received, exiting (in-flight handlers keep their lease until it expires or they finish)");

    for handle in handles {
        handle.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); }
        _ = terminate => { info!("received SIGTERM"); }
    }
}
