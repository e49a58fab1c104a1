//! JSON file storage implementation.
//!
//! All service documents live in one JSON object keyed by service key
//! (`service:environment:plan`). Writes go to a sibling temporary file that
//! is renamed over the original, so readers never observe a torn document.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use meter_relay_core::{ServiceConfig, ServiceState};
use tracing::debug;

use crate::error::Result;
use crate::{check_revision, StateStore};

type Documents = BTreeMap<String, ServiceState>;

/// File-backed state store.
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a store backed by the JSON file at `path`.
    ///
    /// The file and its parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Documents> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Documents::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Documents::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, documents: &Documents) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(documents)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self, config: &ServiceConfig) -> Result<ServiceState> {
        Ok(self
            .read_all()?
            .remove(&config.key())
            .unwrap_or_default())
    }

    fn save(&self, config: &ServiceConfig, state: &mut ServiceState) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut documents = self.read_all()?;
        let key = config.key();
        let stored = documents.get(&key).map_or(0, |doc| doc.revision);
        check_revision(config, stored, state.revision)?;

        let mut next = state.clone();
        next.revision = stored + 1;
        documents.insert(key, next);
        self.write_all(&documents)?;

        state.revision = stored + 1;
        debug!(
            path = %self.path.display(),
            service = %config,
            revision = state.revision,
            "Saved state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use chrono::Utc;
    use meter_relay_core::Period;
    use tempfile::TempDir;

    fn config() -> ServiceConfig {
        ServiceConfig::new("Postgres", "PROD", "pt-1")
    }

    fn temp_store() -> (FileStateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state").join("metering_state.json"));
        (store, dir)
    }

    #[test]
    fn missing_file_loads_default() {
        let (store, _dir) = temp_store();
        let state = store.load(&config()).unwrap();
        assert_eq!(state, ServiceState::default());
    }

    #[test]
    fn save_and_reload() {
        let (store, _dir) = temp_store();
        let period = Period::month(2025, 1).unwrap();

        let mut state = store.load(&config()).unwrap();
        state.mark_success(&period, "E1", Utc::now());
        store.save(&config(), &mut state).unwrap();
        assert_eq!(state.revision, 1);

        let reloaded = store.load(&config()).unwrap();
        assert!(reloaded.is_success(&period, "E1"));
        assert_eq!(reloaded.revision, 1);
    }

    #[test]
    fn stale_revision_conflicts() {
        let (store, _dir) = temp_store();

        let mut first = store.load(&config()).unwrap();
        let mut second = store.load(&config()).unwrap();
        store.save(&config(), &mut first).unwrap();

        let err = store.save(&config(), &mut second).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn services_share_one_file() {
        let (store, _dir) = temp_store();
        let other = ServiceConfig::new("Redis", "DEV", "pt-2");
        let period = Period::month(2025, 2).unwrap();

        let mut a = store.load(&config()).unwrap();
        a.mark_success(&period, "E1", Utc::now());
        store.save(&config(), &mut a).unwrap();

        let mut b = store.load(&other).unwrap();
        b.mark_success(&period, "E9", Utc::now());
        store.save(&other, &mut b).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let documents: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(documents.get("Postgres:PROD:pt-1").is_some());
        assert!(documents.get("Redis:DEV:pt-2").is_some());
        assert!(!store.load(&other).unwrap().is_success(&period, "E1"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let (store, _dir) = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();

        assert!(matches!(
            store.load(&config()),
            Err(StoreError::Serialization(_))
        ));
    }
}
