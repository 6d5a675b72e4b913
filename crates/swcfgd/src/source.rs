//! Where device records come from each cycle.

use std::path::PathBuf;

use async_trait::async_trait;
use swcfg_common::{parse_records, DeviceRecords};

use crate::error::SourceError;

/// Supplier of the per-cycle device record map.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Returns the current records, keyed by device id.
    async fn fetch(&self) -> Result<DeviceRecords, SourceError>;
}

/// Reads records from a JSON file that an external pipeline keeps current.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    /// Creates a source reading `path` on every fetch.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for JsonFileSource {
    async fn fetch(&self) -> Result<DeviceRecords, SourceError> {
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        let records = parse_records(&json)?;
        tracing::debug!(path = %self.path.display(), count = records.len(), "Loaded device records");
        Ok(records)
    }
}
