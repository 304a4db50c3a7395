//! Durable queue storage abstraction and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use orderflow_core::QueueItemId;
use orderflow_orders::StagedOrder;

use super::types::{CallerIdentity, FailureDisposition, QueueItem, QueueStats, QueueStatus};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage unavailable: {0}")]
    Storage(String),
    #[error("failed to encode queue payload: {0}")]
    Serialization(String),
    #[error("corrupt queue row: {0}")]
    Corrupt(String),
}

/// Durable migration work list.
///
/// Implementations must make `claim` atomic (one item is handed to exactly one
/// caller) and make every post-processing update conditional on the item still
/// being in the status the caller expects. The boolean returned by the update
/// methods says whether the conditional write matched.
#[async_trait]
pub trait MigrationQueue: Send + Sync {
    /// Insert a `pending` item with `attempts=0`, due immediately.
    async fn enqueue(
        &self,
        order: &StagedOrder,
        caller_identity: Option<CallerIdentity>,
    ) -> Result<QueueItemId, QueueError>;

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueError>;

    /// Claim the oldest-due `pending` item whose `next_attempt_at <= now`,
    /// flipping it to `processing` and incrementing `attempts`.
    /// Returns `None` if no items are available.
    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, QueueError>;

    /// `processing` → `completed`.
    async fn complete(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError>;

    /// `processing` → `pending` (with a new due time) or `dead_letter`.
    async fn fail(
        &self,
        id: QueueItemId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Hand back items whose claim started before `claimed_before` (crashed worker).
    /// Items already at their attempt budget are dead-lettered instead.
    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError>;

    /// Operator action: `dead_letter` → `pending` with a fresh attempt budget.
    async fn requeue_dead_letter(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// In-memory queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryMigrationQueue {
    items: Mutex<HashMap<QueueItemId, QueueItem>>,
    max_attempts: u32,
}

impl InMemoryMigrationQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Test/dev helper: make an item due at a specific time.
    pub fn reschedule(&self, id: QueueItemId, next_attempt_at: DateTime<Utc>) -> bool {
        match self.items.lock().get_mut(&id) {
            Some(item) => {
                item.next_attempt_at = next_attempt_at;
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryMigrationQueue {
    fn default() -> Self {
        Self::new(super::RetryPolicy::default().max_attempts)
    }
}

#[async_trait]
impl MigrationQueue for InMemoryMigrationQueue {
    async fn enqueue(
        &self,
        order: &StagedOrder,
        caller_identity: Option<CallerIdentity>,
    ) -> Result<QueueItemId, QueueError> {
        let item = QueueItem::new(order, caller_identity, self.max_attempts, Utc::now())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = item.id;
        self.items.lock().insert(id, item);
        Ok(id)
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.items.lock().get(&id).cloned())
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, QueueError> {
        let mut items = self.items.lock();

        let next = items
            .values()
            .filter(|i| i.status == QueueStatus::Pending && i.next_attempt_at <= now)
            .min_by_key(|i| (i.next_attempt_at, i.created_at))
            .map(|i| i.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };
        item.status = QueueStatus::Processing;
        item.attempts += 1;
        item.processing_started_at = Some(now);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn complete(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut items = self.items.lock();
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Processing => {
                item.status = QueueStatus::Completed;
                item.completed_at = Some(now);
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: QueueItemId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut items = self.items.lock();
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Processing => {
                match disposition {
                    FailureDisposition::RetryAt(at) => {
                        item.status = QueueStatus::Pending;
                        item.next_attempt_at = at;
                    }
                    FailureDisposition::DeadLetter => item.status = QueueStatus::DeadLetter,
                }
                item.error_message = Some(error.to_string());
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let mut items = self.items.lock();
        let mut released = 0;
        for item in items.values_mut() {
            let stale = item.status == QueueStatus::Processing
                && item.processing_started_at.is_some_and(|t| t < claimed_before);
            if !stale {
                continue;
            }
            item.status = if item.attempts >= item.max_attempts {
                QueueStatus::DeadLetter
            } else {
                QueueStatus::Pending
            };
            item.next_attempt_at = now;
            item.error_message = Some("claim expired before the item was finished".to_string());
            item.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    async fn requeue_dead_letter(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut items = self.items.lock();
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::DeadLetter => {
                item.status = QueueStatus::Pending;
                item.attempts = 0;
                item.next_attempt_at = now;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.items.lock();
        let mut result: Vec<_> = items
            .values()
            .filter(|i| i.status == QueueStatus::DeadLetter)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.items.lock();
        let mut stats = QueueStats::default();
        for item in items.values() {
            stats.record(item.status);
        }
        Ok(stats)
    }
}
