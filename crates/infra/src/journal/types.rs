use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_orders::StagedOrder;

/// One failed migration chain: a by-value snapshot of the order plus its retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryJournalEntry {
    pub order: StagedOrder,
    pub reason: String,
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RetryJournalEntry {
    /// Exhausted entries stay on disk for an operator.
    pub fn is_dead_letter(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        !self.is_dead_letter(max_retries) && self.next_retry_at <= now
    }
}
