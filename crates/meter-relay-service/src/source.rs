//! Usage record sources.
//!
//! A source exposes the usage files of one `(service, period)` partition.
//! Files are addressed by their key relative to the data root, so the same
//! layout works for a local mirror and for in-memory fixtures.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use meter_relay_core::{Period, RawUsageRecord, ServiceConfig};
use tracing::debug;

use crate::error::{ReconcileError, Result};

/// Listing and reading of usage files.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Keys of every `.json` file in the partition, sorted.
    ///
    /// A partition that does not exist has no files.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Source` if the partition cannot be listed.
    async fn list(&self, config: &ServiceConfig, period: &Period) -> Result<Vec<String>>;

    /// Records stored in one file.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Source` if the file cannot be read or is
    /// not a JSON array of records.
    async fn read(&self, key: &str) -> Result<Vec<RawUsageRecord>>;
}

/// Usage files mirrored under a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryUsageSource {
    root: PathBuf,
}

impl DirectoryUsageSource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl UsageSource for DirectoryUsageSource {
    async fn list(&self, config: &ServiceConfig, period: &Period) -> Result<Vec<String>> {
        let prefix = config.partition_prefix(period);
        let mut pending = vec![PathBuf::from(&prefix)];
        let mut keys = Vec::new();

        while let Some(relative) = pending.pop() {
            let dir = self.root.join(&relative);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ReconcileError::Source(format!(
                        "listing {}: {e}",
                        dir.display()
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = relative.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    pending.push(name);
                } else if name.extension().is_some_and(|ext| ext == "json") {
                    keys.push(name.to_string_lossy().into_owned());
                }
            }
        }

        keys.sort();
        debug!(prefix = %prefix, files = keys.len(), "Listed usage files");
        Ok(keys)
    }

    async fn read(&self, key: &str) -> Result<Vec<RawUsageRecord>> {
        let path = self.root.join(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ReconcileError::Source(format!("reading {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ReconcileError::Source(format!("parsing {}: {e}", path.display())))
    }
}

/// Usage files held in memory, keyed like `DirectoryUsageSource` keys.
#[derive(Debug, Default)]
pub struct MemoryUsageSource {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryUsageSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file of records to the partition of `(config, period)`.
    ///
    /// # Panics
    ///
    /// Panics if the records cannot be serialized.
    pub fn add_records(
        &self,
        config: &ServiceConfig,
        period: &Period,
        name: &str,
        records: &[RawUsageRecord],
    ) {
        let contents = serde_json::to_string(records).expect("usage records serialize");
        self.add_raw(config, period, name, contents);
    }

    /// Add a file with arbitrary contents to the partition of `(config, period)`.
    pub fn add_raw(
        &self,
        config: &ServiceConfig,
        period: &Period,
        name: &str,
        contents: impl Into<String>,
    ) {
        let key = format!("{}{name}", config.partition_prefix(period));
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, contents.into());
    }
}

#[async_trait]
impl UsageSource for MemoryUsageSource {
    async fn list(&self, config: &ServiceConfig, period: &Period) -> Result<Vec<String>> {
        let prefix = config.partition_prefix(period);
        Ok(self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.starts_with(&prefix) && key.ends_with(".json"))
            .cloned()
            .collect())
    }

    async fn read(&self, key: &str) -> Result<Vec<RawUsageRecord>> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = files
            .get(key)
            .ok_or_else(|| ReconcileError::Source(format!("no such file: {key}")))?;
        serde_json::from_str(contents)
            .map_err(|e| ReconcileError::Source(format!("parsing {key}: {e}")))
    }
}
