//! On-disk mirror of the staging store: one JSON file per order plus an index.

use std::path::{Path, PathBuf};

use orderflow_core::StagingId;
use orderflow_orders::StagedOrder;

use crate::json_file::{read_json, remove_if_exists, write_json_atomic};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staging disk I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("staging record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct DiskMirror {
    dir: PathBuf,
}

impl DiskMirror {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn order_path(&self, id: &StagingId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub(crate) async fn write_order(&self, order: &StagedOrder) -> Result<(), StagingError> {
        write_json_atomic(&self.order_path(&order.id), order).await
    }

    pub(crate) async fn read_order(&self, id: &StagingId) -> Result<Option<StagedOrder>, StagingError> {
        read_json(&self.order_path(id)).await
    }

    /// Returns whether a file was actually removed.
    pub(crate) async fn remove_order(&self, id: &StagingId) -> Result<bool, StagingError> {
        Ok(remove_if_exists(&self.order_path(id)).await?)
    }

    pub(crate) async fn write_index(&self, ids: &[StagingId]) -> Result<(), StagingError> {
        write_json_atomic(&self.dir.join(INDEX_FILE), ids).await
    }

    pub(crate) async fn read_index(&self) -> Result<Vec<String>, StagingError> {
        Ok(read_json::<_, StagingError>(&self.dir.join(INDEX_FILE))
            .await?
            .unwrap_or_default())
    }
}
