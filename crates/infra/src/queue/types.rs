//! Durable queue item types and the retry policy shared with the retry journal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{QueueItemId, StagingId};
use orderflow_orders::StagedOrder;

/// Queue item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for `next_attempt_at`
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Migrated successfully
    Completed,
    /// Reserved for items that fail outside the worker (kept for schema parity)
    Failed,
    /// Exhausted retries or unrecoverable; needs an operator
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "dead_letter" => Ok(QueueStatus::DeadLetter),
            other => Err(format!("invalid queue status: {other}")),
        }
    }
}

/// Exponential retry policy: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before an item is dead-lettered
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 2u32.saturating_pow((attempt - 1).min(31));
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// When the next attempt is due after `attempt` failed at `now`.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Caller identity recorded alongside a queued order (who triggered the migration).
pub type CallerIdentity = serde_json::Value;

/// A durable migration work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub staging_id: StagingId,
    /// Opaque staged-order snapshot; decoded only when the item is processed.
    pub payload: serde_json::Value,
    pub caller_identity: Option<CallerIdentity>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
}

impl QueueItem {
    /// Build a fresh `pending` item for a staged order.
    pub fn new(
        order: &StagedOrder,
        caller_identity: Option<CallerIdentity>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: QueueItemId::new(),
            staging_id: order.id.clone(),
            payload: serde_json::to_value(order)?,
            caller_identity,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
            next_attempt_at: now,
            error_message: None,
            correlation_id: order
                .metadata
                .payment_link
                .as_ref()
                .map(|l| l.gateway_id.clone()),
        })
    }

    pub fn decode_order(&self) -> Result<StagedOrder, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// How a failed attempt should be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, due again at the given time.
    RetryAt(DateTime<Utc>),
    /// Straight to `dead_letter`.
    DeadLetter,
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: QueueStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: QueueStatus, count: usize) {
        let slot = match status {
            QueueStatus::Pending => &mut self.pending,
            QueueStatus::Processing => &mut self.processing,
            QueueStatus::Completed => &mut self.completed,
            QueueStatus::Failed => &mut self.failed,
            QueueStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += count;
    }
}
