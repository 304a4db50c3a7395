mod signal;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use orderflow_infra::PipelineConfig;
use orderflow_infra::journal::{RetryJournal, RetrySweeper};
use orderflow_infra::migration::{
    InMemoryPermanentStore, Migrator, PermanentStore, PostgresPermanentStore,
};
use orderflow_infra::queue::{
    InMemoryMigrationQueue, MigrationQueue, PostgresMigrationQueue, QueueWorker,
};
use orderflow_infra::staging::StagingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let (queue, permanent): (Arc<dyn MigrationQueue>, Arc<dyn PermanentStore>) =
        match config.database_url.as_deref() {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("failed to connect to Postgres")?;

                let queue = PostgresMigrationQueue::new(pool.clone(), config.queue.retry.max_attempts);
                queue.ensure_schema().await.context("failed to create queue schema")?;
                let store = PostgresPermanentStore::new(pool);
                store
                    .ensure_schema()
                    .await
                    .context("failed to create permanent store schema")?;

                let queue: Arc<dyn MigrationQueue> = Arc::new(queue);
                let store: Arc<dyn PermanentStore> = Arc::new(store);
                (queue, store)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory queue and permanent store (development only)");
                let queue: Arc<dyn MigrationQueue> =
                    Arc::new(InMemoryMigrationQueue::new(config.queue.retry.max_attempts));
                let store: Arc<dyn PermanentStore> = Arc::new(InMemoryPermanentStore::new());
                (queue, store)
            }
        };

    let staging = Arc::new(StagingStore::new(config.staging.clone()));
    if let Err(e) = staging.load_index().await {
        warn!(error = %e, "could not load staging index; starting with an empty store");
    }

    match queue.stats().await {
        Ok(stats) if stats.dead_letter > 0 => {
            warn!(?stats, "durable queue has dead-lettered items awaiting an operator")
        }
        Ok(stats) => info!(?stats, "durable queue ready"),
        Err(e) => warn!(error = %e, "could not read durable queue stats"),
    }

    let migrator = Migrator::new(permanent, config.pricing).with_staging(staging.clone());
    let journal = Arc::new(RetryJournal::new(&config.journal));

    let staging_tasks = staging.start();
    let worker = QueueWorker::new(queue, migrator.clone(), config.queue.clone()).spawn();
    let sweeper = Arc::new(RetrySweeper::new(journal, migrator)).spawn(config.journal.sweep_interval);

    info!(
        staging_dir = %config.staging.dir.display(),
        journal_dir = %config.journal.dir.display(),
        "orderflow worker running"
    );

    if let Err(e) = signal::shutdown_signal().await {
        warn!(error = %e, "signal handler failed; shutting down");
    }

    let stats = worker.shutdown().await;
    sweeper.shutdown().await;
    staging_tasks.shutdown().await;
    info!(?stats, staged = staging.count(), "orderflow worker stopped");

    Ok(())
}
