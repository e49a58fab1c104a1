//! In-memory storage implementation for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use meter_relay_core::{ServiceConfig, ServiceState};

use crate::error::Result;
use crate::{check_revision, StateStore};

/// State store that keeps documents in a map.
#[derive(Default)]
pub struct MemoryStateStore {
    documents: Mutex<HashMap<String, ServiceState>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the document for `config`, replacing any existing one.
    pub fn insert(&self, config: &ServiceConfig, state: ServiceState) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.key(), state);
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, config: &ServiceConfig) -> Result<ServiceState> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&config.key())
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, config: &ServiceConfig, state: &mut ServiceState) -> Result<()> {
        let mut documents = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let stored = documents.get(&config.key()).map_or(0, |doc| doc.revision);
        check_revision(config, stored, state.revision)?;

        state.revision = stored + 1;
        documents.insert(config.key(), state.clone());
        Ok(())
    }
}
