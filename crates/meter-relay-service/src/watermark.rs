//! Data-completeness watermark sources.
//!
//! The ingestion pipeline publishes one document mapping service keys to
//! the last instant it has fully exported:
//!
//! ```json
//! { "Postgres:PROD:pt-1": { "last_processed_to": "2025-01-31T23:59:00Z" } }
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meter_relay_core::ServiceConfig;
use serde::Deserialize;
use tracing::warn;

use crate::error::{ReconcileError, Result};

/// Provider of the last fully exported instant per service.
#[async_trait]
pub trait WatermarkSource: Send + Sync {
    /// The watermark for `config`, or `None` if nothing is known complete.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Source` if the watermark document exists but
    /// cannot be read or parsed.
    async fn last_processed_to(&self, config: &ServiceConfig) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, Deserialize)]
struct ExportState {
    #[serde(default)]
    last_processed_to: Option<String>,
}

/// Watermark document stored as a local JSON file.
#[derive(Debug, Clone)]
pub struct FileWatermarkSource {
    path: PathBuf,
}

impl FileWatermarkSource {
    /// Create a source reading the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WatermarkSource for FileWatermarkSource {
    async fn last_processed_to(&self, config: &ServiceConfig) -> Result<Option<DateTime<Utc>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Watermark document not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(ReconcileError::Source(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut document: HashMap<String, ExportState> = serde_json::from_slice(&bytes)
            .map_err(|e| ReconcileError::Source(format!("parsing {}: {e}", self.path.display())))?;

        let Some(raw) = document
            .remove(&config.key())
            .and_then(|state| state.last_processed_to)
        else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(instant) => Ok(Some(instant.with_timezone(&Utc))),
            Err(e) => {
                warn!(service = %config, value = %raw, error = %e, "Unreadable watermark");
                Ok(None)
            }
        }
    }
}

/// Watermarks held in memory.
#[derive(Debug, Default)]
pub struct MemoryWatermarkSource {
    marks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryWatermarkSource {
    /// Create a source with no watermarks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the watermark for `config`.
    pub fn set(&self, config: &ServiceConfig, instant: DateTime<Utc>) {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.key(), instant);
    }
}

#[async_trait]
impl WatermarkSource for MemoryWatermarkSource {
    async fn last_processed_to(&self, config: &ServiceConfig) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&config.key())
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn config() -> ServiceConfig {
        ServiceConfig::new("Postgres", "PROD", "pt-1")
    }

    #[tokio::test]
    async fn reads_service_watermark() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_success_export.json");
        let document = json!({
            "Postgres:PROD:pt-1": {"last_processed_to": "2025-01-31T23:59:00Z"},
            "Redis:PROD:pt-2": {"last_processed_to": "2024-06-01T00:00:00Z"},
        });
        std::fs::write(&path, document.to_string()).unwrap();

        let source = FileWatermarkSource::new(&path);
        assert_eq!(
            source.last_processed_to(&config()).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn absent_document_key_or_field_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_success_export.json");
        let source = FileWatermarkSource::new(&path);
        assert_eq!(source.last_processed_to(&config()).await.unwrap(), None);

        std::fs::write(&path, json!({"Postgres:PROD:pt-1": {}}).to_string()).unwrap();
        assert_eq!(source.last_processed_to(&config()).await.unwrap(), None);

        std::fs::write(&path, json!({"Other:PROD:pt-1": {}}).to_string()).unwrap();
        assert_eq!(source.last_processed_to(&config()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_success_export.json");
        std::fs::write(&path, "not json").unwrap();

        let source = FileWatermarkSource::new(&path);
        assert!(source.last_processed_to(&config()).await.is_err());
    }
}
