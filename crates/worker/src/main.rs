use std::sync::Arc;

use anyhow::{Context, Result};
use atcdrill_jobs::{InMemoryJobStore, JobStore, PostgresJobStore, QueueSystem};
use atcdrill_worker::{
    discovered_modules, init_telemetry, JobContext, LogMailer, TelemetryConfig, WorkerConfig,
};
use tracing::Instrument;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "atcdrill_worker=info,atcdrill_jobs=info")
    init_telemetry(TelemetryConfig::from_env());

    let config = WorkerConfig::from_env();
    let span = tracing::info_span!("worker", worker_id = %config.worker_id);
    run(config).instrument(span).await
}

async fn run(config: WorkerConfig) -> Result<()> {
    let store_kind = match config.database_url {
        Some(_) => "postgres",
        None => "memory",
    };
    tracing::info!(
        store = store_kind,
        shutdown_timeout_secs = config.shutdown_timeout.as_secs(),
        concurrency_override = ?config.concurrency_override,
        "atcdrill-worker starting..."
    );

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("Failed to connect to job database")?;
            store
                .migrate()
                .await
                .context("Failed to apply job queue schema")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory and lost on exit");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let ctx = JobContext::new(Arc::new(LogMailer), &config);
    let system = QueueSystem::new(store);

    let report = system.load_modules(&discovered_modules(), &ctx).await;
    for (module, error) in &report.failed {
        tracing::warn!(module, error = %error, "Job module not loaded");
    }

    system
        .initialize()
        .await
        .context("Failed to initialize job queues")?;

    let status = system.status().await;
    tracing::info!(queues = ?status.registry.queues, "Worker ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    system.shutdown().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
