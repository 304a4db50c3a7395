use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::store::{JournalError, RetryJournal};
use super::types::RetryJournalEntry;
use crate::migration::{MigrationError, Migrator};
use crate::workers::{run_every, WorkerHandle};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub migrated: usize,
    pub rescheduled: usize,
    /// Entries that just ran out of retries.
    pub exhausted: usize,
    /// Entries that could not be read back or rewritten.
    pub journal_errors: usize,
}

/// Periodically retries due journal entries through the migrator.
///
/// Sweeps within one process never overlap. Sweepers in different processes
/// may pick the same entry, which is harmless because migration is keyed by
/// staging id.
pub struct RetrySweeper {
    journal: Arc<RetryJournal>,
    migrator: Migrator,
    running: tokio::sync::Mutex<()>,
}

impl RetrySweeper {
    pub fn new(journal: Arc<RetryJournal>, migrator: Migrator) -> Self {
        Self {
            journal,
            migrator,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, JournalError> {
        let _running = self.running.lock().await;
        let mut report = SweepReport::default();

        for entry in self.journal.due_entries(now).await? {
            report.attempted += 1;
            match self.migrator.migrate(&entry.order).await {
                Ok(permanent_order_id) => {
                    info!(
                        staging_id = %entry.order.id,
                        %permanent_order_id,
                        retry_count = entry.retry_count,
                        "journaled order migrated"
                    );
                    report.migrated += 1;
                    if let Err(e) = self.journal.remove(&entry.order.id).await {
                        error!(staging_id = %entry.order.id, error = %e, "failed to remove migrated journal entry");
                        report.journal_errors += 1;
                    }
                }
                Err(err) => {
                    let entry = self.reschedule(entry, &err, now);
                    if entry.is_dead_letter(self.journal.retry_policy().max_attempts) {
                        warn!(
                            staging_id = %entry.order.id,
                            retry_count = entry.retry_count,
                            error = %err,
                            "journaled order exhausted its retries; left for an operator"
                        );
                        report.exhausted += 1;
                    } else {
                        warn!(
                            staging_id = %entry.order.id,
                            retry_count = entry.retry_count,
                            next_retry_at = %entry.next_retry_at,
                            error = %err,
                            "journaled order still failing; rescheduled"
                        );
                        report.rescheduled += 1;
                    }
                    if let Err(e) = self.journal.save(&entry).await {
                        error!(staging_id = %entry.order.id, error = %e, "failed to rewrite journal entry");
                        report.journal_errors += 1;
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(?report, "retry journal sweep finished");
        }
        Ok(report)
    }

    fn reschedule(&self, mut entry: RetryJournalEntry, err: &MigrationError, now: DateTime<Utc>) -> RetryJournalEntry {
        let policy = self.journal.retry_policy();
        entry.retry_count += 1;
        if !err.is_retryable() {
            entry.retry_count = entry.retry_count.max(policy.max_attempts);
        }
        entry.reason = err.to_string();
        entry.last_retry_at = Some(now);
        entry.next_retry_at = policy.next_attempt_at(entry.retry_count + 1, now);
        entry
    }

    /// Sweep every `interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> WorkerHandle {
        WorkerHandle::spawn("retry-sweeper", move |cancel| {
            run_every(cancel, interval, move || {
                let sweeper = self.clone();
                async move {
                    if let Err(e) = sweeper.sweep(Utc::now()).await {
                        error!(error = %e, "retry journal sweep failed");
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use super::*;
    use crate::config::JournalConfig;
    use crate::migration::InMemoryPermanentStore;
    use crate::queue::RetryPolicy;
    use crate::testing::staged_order;
    use orderflow_core::PricePolicy;

    fn setup(dir: &TempDir) -> (Arc<RetryJournal>, Arc<InMemoryPermanentStore>, RetrySweeper) {
        let journal = Arc::new(RetryJournal::new(&JournalConfig {
            dir: dir.path().to_path_buf(),
            sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy::exponential(5, Duration::from_secs(30), Duration::from_secs(3600)),
        }));
        let store = Arc::new(InMemoryPermanentStore::new());
        let sweeper = RetrySweeper::new(
            journal.clone(),
            Migrator::new(store.clone(), PricePolicy::default()),
        );
        (journal, store, sweeper)
    }

    #[tokio::test]
    async fn successful_retry_removes_entry() {
        let dir = TempDir::new().unwrap();
        let (journal, store, sweeper) = setup(&dir);
        let now = Utc::now();
        journal
            .add_failed_order_at(&staged_order("TEMP-1-0001"), "db down", now)
            .await
            .unwrap();

        // Not due yet
        let report = sweeper.sweep(now).await.unwrap();
        assert_eq!(report.attempted, 0);

        let report = sweeper.sweep(now + ChronoDuration::seconds(30)).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(store.order_count(), 1);
        assert!(journal.list_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_retry_backs_off_and_eventually_stays_as_dead_letter() {
        let dir = TempDir::new().unwrap();
        let (journal, store, sweeper) = setup(&dir);
        store.fail_next(100);
        let start = Utc::now();
        let first = journal
            .add_failed_order_at(&staged_order("TEMP-1-0001"), "db down", start)
            .await
            .unwrap();

        let mut due = first.next_retry_at;
        let mut previous = due;
        for n in 1..=5u32 {
            let report = sweeper.sweep(due).await.unwrap();
            assert_eq!(report.attempted, 1);
            let entry = journal.get(&first.order.id).await.unwrap().unwrap();
            assert_eq!(entry.retry_count, n);
            assert!(entry.next_retry_at > previous);
            previous = entry.next_retry_at;
            due = entry.next_retry_at;
        }

        let report = sweeper.sweep(due + ChronoDuration::days(1)).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(journal.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn integrity_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let (journal, _store, sweeper) = setup(&dir);
        let mut order = staged_order("TEMP-1-0001");
        order.items[0].unit_price = None;
        let entry = journal.add_failed_order(&order, "bad price").await.unwrap();

        let report = sweeper.sweep(entry.next_retry_at).await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(journal.dead_letters().await.unwrap().len(), 1);
    }
}
