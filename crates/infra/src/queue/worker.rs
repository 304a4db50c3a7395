//! Queue worker: claim → migrate → complete / retry / dead-letter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use orderflow_core::{PermanentOrderId, QueueItemId};

use super::store::{MigrationQueue, QueueError};
use super::types::{FailureDisposition, QueueItem};
use crate::config::QueueConfig;
use crate::migration::{MigrationError, Migrator};
use crate::workers::{pause, WorkerHandle};

/// What happened to one claimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed {
        id: QueueItemId,
        permanent_order_id: PermanentOrderId,
    },
    Retrying {
        id: QueueItemId,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        id: QueueItemId,
        error: String,
    },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_retried: u64,
    pub items_dead_lettered: u64,
    pub stale_claims_released: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ItemOutcome) {
        self.items_processed += 1;
        match outcome {
            ItemOutcome::Completed { .. } => self.items_succeeded += 1,
            ItemOutcome::Retrying { .. } => self.items_retried += 1,
            ItemOutcome::DeadLettered { .. } => self.items_dead_lettered += 1,
        }
    }
}

/// Drains the durable queue through the migrator.
///
/// Safe to run in several processes against the same Postgres queue: the
/// claim is atomic and every status write is conditional on `processing`.
#[derive(Clone)]
pub struct QueueWorker {
    queue: Arc<dyn MigrationQueue>,
    migrator: Migrator,
    config: QueueConfig,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn MigrationQueue>, migrator: Migrator, config: QueueConfig) -> Self {
        Self {
            queue,
            migrator,
            config,
        }
    }

    /// Claim and fully process one due item. `Ok(None)` when nothing is due.
    pub async fn process_next(&self, now: DateTime<Utc>) -> Result<Option<ItemOutcome>, QueueError> {
        let Some(item) = self.queue.claim(now).await? else {
            return Ok(None);
        };
        debug!(
            queue_item_id = %item.id,
            staging_id = %item.staging_id,
            attempt = item.attempts,
            "claimed queue item"
        );

        let result = match item.decode_order() {
            Ok(order) => self.migrator.migrate(&order).await,
            Err(e) => Err(MigrationError::Integrity(format!("undecodable payload: {e}"))),
        };

        let outcome = match result {
            Ok(permanent_order_id) => {
                if !self.queue.complete(item.id, Utc::now()).await? {
                    warn!(queue_item_id = %item.id, "item was no longer processing when completed");
                }
                ItemOutcome::Completed {
                    id: item.id,
                    permanent_order_id,
                }
            }
            Err(err) => self.record_failure(&item, err, now).await?,
        };
        Ok(Some(outcome))
    }

    async fn record_failure(
        &self,
        item: &QueueItem,
        err: MigrationError,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, QueueError> {
        let message = err.to_string();
        let exhausted = item.attempts >= item.max_attempts;

        let (disposition, outcome) = if !err.is_retryable() || exhausted {
            error!(
                queue_item_id = %item.id,
                staging_id = %item.staging_id,
                attempt = item.attempts,
                retryable = err.is_retryable(),
                error = %message,
                "migration dead-lettered"
            );
            (
                FailureDisposition::DeadLetter,
                ItemOutcome::DeadLettered {
                    id: item.id,
                    error: message.clone(),
                },
            )
        } else {
            let next_attempt_at = self.config.retry.next_attempt_at(item.attempts, now);
            warn!(
                queue_item_id = %item.id,
                staging_id = %item.staging_id,
                attempt = item.attempts,
                next_attempt_at = %next_attempt_at,
                error = %message,
                "migration failed; will retry"
            );
            (
                FailureDisposition::RetryAt(next_attempt_at),
                ItemOutcome::Retrying {
                    id: item.id,
                    next_attempt_at,
                },
            )
        };

        if !self.queue.fail(item.id, &message, disposition, Utc::now()).await? {
            warn!(queue_item_id = %item.id, "item was no longer processing when failure was recorded");
        }
        Ok(outcome)
    }

    /// Process items until none is due at `now`.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<Vec<ItemOutcome>, QueueError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next(now).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Hand back claims older than the stale-claim timeout.
    pub async fn release_stale(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let timeout = chrono::Duration::from_std(self.config.stale_claim_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let released = self.queue.release_stale(now - timeout, now).await?;
        if released > 0 {
            warn!(released, "released stale queue claims");
        }
        Ok(released)
    }

    /// Run the worker loop until the handle is shut down.
    pub fn spawn(self) -> QueueWorkerHandle {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let shared = stats.clone();
        let poll = self.config.poll_interval;

        let handle = WorkerHandle::spawn("queue-worker", move |cancel| async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match self.process_next(Utc::now()).await {
                    Ok(Some(outcome)) => {
                        shared.lock().record(&outcome);
                        continue;
                    }
                    Ok(None) => match self.release_stale(Utc::now()).await {
                        Ok(n) => shared.lock().stale_claims_released += n as u64,
                        Err(e) => error!(error = %e, "failed to release stale claims"),
                    },
                    Err(e) => error!(error = %e, "queue worker iteration failed"),
                }
                if !pause(&cancel, poll).await {
                    break;
                }
            }
            info!(stats = ?*shared.lock(), "queue worker exiting");
        });

        QueueWorkerHandle { handle, stats }
    }
}

/// Handle to a running queue worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    handle: WorkerHandle,
    stats: Arc<Mutex<WorkerStats>>,
}

impl QueueWorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Stop after the in-flight item (if any) is finished.
    pub async fn shutdown(self) -> WorkerStats {
        self.handle.shutdown().await;
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::migration::InMemoryPermanentStore;
    use crate::queue::{InMemoryMigrationQueue, QueueStatus, RetryPolicy};
    use crate::testing::staged_order;
    use orderflow_core::PricePolicy;

    fn setup(max_attempts: u32) -> (Arc<InMemoryMigrationQueue>, Arc<InMemoryPermanentStore>, QueueWorker) {
        let queue = Arc::new(InMemoryMigrationQueue::new(max_attempts));
        let store = Arc::new(InMemoryPermanentStore::new());
        let config = QueueConfig {
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy::exponential(max_attempts, Duration::from_secs(30), Duration::from_secs(3600)),
            ..QueueConfig::default()
        };
        let worker = QueueWorker::new(
            queue.clone(),
            Migrator::new(store.clone(), PricePolicy::default()),
            config,
        );
        (queue, store, worker)
    }

    #[tokio::test]
    async fn successful_item_is_completed() {
        let (queue, store, worker) = setup(3);
        let id = queue.enqueue(&staged_order("TEMP-1-0001"), None).await.unwrap();

        let outcome = worker.process_next(Utc::now()).await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Completed { .. }));

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert!(item.completed_at.is_some());
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_exponentially() {
        let (queue, store, worker) = setup(5);
        store.fail_next(2);
        let id = queue.enqueue(&staged_order("TEMP-1-0001"), None).await.unwrap();
        let t0 = Utc::now();

        let first = worker.process_next(t0).await.unwrap().unwrap();
        let ItemOutcome::Retrying { next_attempt_at: n1, .. } = first else {
            panic!("expected retry, got {first:?}");
        };
        assert_eq!(n1, t0 + ChronoDuration::seconds(30));
        assert!(worker.process_next(t0).await.unwrap().is_none());

        let second = worker.process_next(n1).await.unwrap().unwrap();
        let ItemOutcome::Retrying { next_attempt_at: n2, .. } = second else {
            panic!("expected retry, got {second:?}");
        };
        assert_eq!(n2, n1 + ChronoDuration::seconds(60));

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 2);
        assert!(item.error_message.is_some());
    }

    #[tokio::test]
    async fn exhausted_item_is_dead_lettered_and_never_reclaimed() {
        let (queue, store, worker) = setup(3);
        store.fail_next(10);
        let id = queue.enqueue(&staged_order("TEMP-1-0001"), None).await.unwrap();

        let mut now = Utc::now();
        for _ in 0..3 {
            let outcome = worker.process_next(now).await.unwrap().unwrap();
            if let ItemOutcome::Retrying { next_attempt_at, .. } = outcome {
                now = next_attempt_at;
            }
        }

        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::DeadLetter);
        assert_eq!(item.attempts, 3);
        assert!(worker.process_next(now + ChronoDuration::days(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn integrity_failure_is_dead_lettered_immediately() {
        let (queue, _store, worker) = setup(3);
        let mut order = staged_order("TEMP-1-0001");
        order.items[0].unit_price = None;
        let id = queue.enqueue(&order, None).await.unwrap();

        let outcome = worker.process_next(Utc::now()).await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::DeadLettered { .. }));
        assert_eq!(queue.get(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_drain() {
        let (queue, store, worker) = setup(3);
        let mut broken = staged_order("TEMP-1-0001");
        broken.items[0].unit_price = None;
        queue.enqueue(&broken, None).await.unwrap();
        queue.enqueue(&staged_order("TEMP-2-0002"), None).await.unwrap();

        let outcomes = worker.drain(Utc::now()).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn spawned_worker_processes_and_shuts_down() {
        let (queue, store, worker) = setup(3);
        let id = queue.enqueue(&staged_order("TEMP-1-0001"), None).await.unwrap();

        let handle = worker.spawn();
        for _ in 0..100 {
            if store.order_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(stats.items_succeeded, 1);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, QueueStatus::Completed);
    }
}
