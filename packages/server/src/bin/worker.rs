// Worker daemon entry point: explicit construction and wiring, no globals.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_core::domains::emails::{build_registry, build_schemas, default_renderers};
use docket_core::domains::emails::PgAssignmentStore;
use docket_core::kernel::archive::{BlobArchiver, LocalObjectStore, ObjectStore};
use docket_core::kernel::jobs::{
    JobEventHub, JobQueue, JobStore, JobType, Maintenance, Monitor, PostgresJobStore,
    QueueDefaults, SharedJobRegistry, WorkerDescriptor, WorkerPool,
};
use docket_core::kernel::mail::{EnvMailAccounts, HttpMailClient, MailFetcher};
use docket_core::kernel::WorkerDeps;
use docket_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docket_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting Docket worker daemon");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("database ready");

    // Stores and clients.
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&config.storage_root));
    objects
        .ensure_container()
        .await
        .map_err(|e| anyhow::anyhow!("storage root unavailable: {e}"))?;
    let archiver = Arc::new(BlobArchiver::new(objects));
    let mail_client = Arc::new(HttpMailClient::new(config.mail_api_base_url.clone())?);
    let fetcher = Arc::new(MailFetcher::new(
        mail_client,
        config.rate_limit.clone(),
        config.retry.clone(),
    ));

    // Queue, dependencies, registry.
    let hub = JobEventHub::new();
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        hub.clone(),
        build_schemas(),
        QueueDefaults {
            timeout_ms: config.default_timeout_ms,
            max_retries: config.default_max_retries,
            depth_ceiling: config.queue_depth_ceiling,
        },
    ));
    let deps = Arc::new(WorkerDeps::new(
        store.clone(),
        queue.clone(),
        archiver,
        fetcher,
        Arc::new(EnvMailAccounts::from_env()),
        Arc::new(PgAssignmentStore::new(pool)),
        default_renderers(),
        config.export_ttl_ms,
    ));
    let registry: SharedJobRegistry = Arc::new(build_registry());

    // One worker per concern, plus a shared utility worker.
    let descriptors = vec![
        WorkerDescriptor::new(
            "archival-worker",
            vec![JobType::EmailArchival, JobType::ContentAnalysis],
        )
        .with_max_concurrency(4),
        WorkerDescriptor::new("assignment-worker", vec![JobType::BulkAssignment])
            .with_max_concurrency(2),
        WorkerDescriptor::new(
            "utility-worker",
            vec![JobType::StorageCleanup, JobType::Export, JobType::Maintenance],
        )
        .with_max_concurrency(2),
    ];

    let worker_pool = Arc::new(WorkerPool::new(
        queue,
        registry,
        deps,
        config.retry.clone(),
        config.pool.clone(),
        descriptors,
    ));
    let maintenance = Arc::new(Maintenance::new(
        store.clone(),
        config.cleanup.clone(),
        config.stall.clone(),
    ));
    let monitor = Arc::new(Monitor::new(
        store,
        worker_pool.state(),
        hub,
        config.monitor.clone(),
    ));

    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(worker_pool.run(shutdown.clone()));
    let maintenance_task = tokio::spawn(maintenance.run(shutdown.clone()));
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    let _ = pool_task.await;
    let _ = maintenance_task.await;
    let _ = monitor_task.await;
    tracing::info!("worker daemon stopped");
    Ok(())
}
