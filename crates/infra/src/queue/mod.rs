//! Durable migration queue.
//!
//! Work items survive process restarts (Postgres backend) and are processed
//! at least once by [`QueueWorker`]. Claims are atomic, so any number of
//! workers may poll the same table.

mod postgres;
mod store;
mod types;
mod worker;

pub use postgres::PostgresMigrationQueue;
pub use store::{InMemoryMigrationQueue, MigrationQueue, QueueError};
pub use types::{CallerIdentity, FailureDisposition, QueueItem, QueueStats, QueueStatus, RetryPolicy};
pub use worker::{ItemOutcome, QueueWorker, QueueWorkerHandle, WorkerStats};
