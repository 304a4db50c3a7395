use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use orderflow_core::StagingId;
use orderflow_orders::StagedOrder;

use super::types::RetryJournalEntry;
use crate::config::JournalConfig;
use crate::json_file::{read_json, remove_if_exists, write_json_atomic};
use crate::queue::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("retry journal I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("retry journal entry is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Directory of `{staging_id}.json` retry entries.
#[derive(Debug)]
pub struct RetryJournal {
    dir: PathBuf,
    retry: RetryPolicy,
    // Serializes read-modify-write of entry files.
    gate: tokio::sync::Mutex<()>,
}

impl RetryJournal {
    pub fn new(config: &JournalConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            retry: config.retry.clone(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &StagingId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn add_failed_order(
        &self,
        order: &StagedOrder,
        reason: &str,
    ) -> Result<RetryJournalEntry, JournalError> {
        self.add_failed_order_at(order, reason, Utc::now()).await
    }

    /// Record a failed migration. An existing entry for the same order keeps
    /// its retry count and schedule; only the snapshot and reason are refreshed.
    pub async fn add_failed_order_at(
        &self,
        order: &StagedOrder,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryJournalEntry, JournalError> {
        let _gate = self.gate.lock().await;
        let path = self.entry_path(&order.id);

        let entry = match read_json::<RetryJournalEntry, JournalError>(&path).await? {
            Some(existing) => RetryJournalEntry {
                order: order.clone(),
                reason: reason.to_string(),
                ..existing
            },
            None => RetryJournalEntry {
                order: order.clone(),
                reason: reason.to_string(),
                retry_count: 0,
                last_retry_at: None,
                next_retry_at: self.retry.next_attempt_at(1, now),
                created_at: now,
            },
        };
        write_json_atomic::<_, JournalError>(&path, &entry).await?;
        info!(
            staging_id = %order.id,
            next_retry_at = %entry.next_retry_at,
            reason,
            "order added to retry journal"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &StagingId) -> Result<Option<RetryJournalEntry>, JournalError> {
        read_json(&self.entry_path(id)).await
    }

    /// Overwrite an entry (used by the sweeper after a failed retry).
    pub async fn save(&self, entry: &RetryJournalEntry) -> Result<(), JournalError> {
        let _gate = self.gate.lock().await;
        write_json_atomic(&self.entry_path(&entry.order.id), entry).await
    }

    pub async fn remove(&self, id: &StagingId) -> Result<bool, JournalError> {
        let _gate = self.gate.lock().await;
        Ok(remove_if_exists(&self.entry_path(id)).await?)
    }

    /// Every readable entry, oldest first. Unreadable files are logged and skipped.
    pub async fn list_entries(&self) -> Result<Vec<RetryJournalEntry>, JournalError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<RetryJournalEntry, JournalError>(&path).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable retry journal entry"),
            }
        }
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.order.id.cmp(&b.order.id))
        });
        Ok(entries)
    }

    /// Entries whose backoff has elapsed and that still have retries left.
    pub async fn due_entries(&self, now: DateTime<Utc>) -> Result<Vec<RetryJournalEntry>, JournalError> {
        let max = self.retry.max_attempts;
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .filter(|e| e.is_due(now, max))
            .collect())
    }

    /// Entries that exhausted their retries and wait for an operator.
    pub async fn dead_letters(&self) -> Result<Vec<RetryJournalEntry>, JournalError> {
        let max = self.retry.max_attempts;
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .filter(|e| e.is_dead_letter(max))
            .collect())
    }
}
