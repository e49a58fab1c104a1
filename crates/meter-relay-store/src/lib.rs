//! Ledger and cursor persistence for meter-relay.
//!
//! Every service configuration owns one `ServiceState` document. All
//! ledger and cursor operations load the whole document, mutate it and
//! save it back. Saves are conditional on the revision that was loaded, so
//! a concurrent writer surfaces as `StoreError::Conflict` instead of
//! silently overwriting.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meter_relay_core::{Period, ServiceConfig};
//! use meter_relay_store::{FileStateStore, Ledger};
//!
//! let store = Arc::new(FileStateStore::new("/tmp/metering_state.json"));
//! let config = ServiceConfig::new("Postgres", "PROD", "pt-1");
//! let ledger = Ledger::new(store, config, Period::month(2025, 1).unwrap());
//!
//! if !ledger.is_resolved("E1").unwrap() {
//!     ledger.mark_success("E1").unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cursor;
pub mod error;
pub mod file;
pub mod ledger;
pub mod memory;

pub use cursor::CursorTracker;
pub use error::{Result, StoreError};
pub use file::FileStateStore;
pub use ledger::Ledger;
pub use memory::MemoryStateStore;

use meter_relay_core::{ServiceConfig, ServiceState};

/// Whole-document persistence for service state.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., a JSON file, in-memory for testing).
pub trait StateStore: Send + Sync {
    /// Load the document for `config`.
    ///
    /// A missing document yields `ServiceState::default()` at revision 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read or parsed.
    fn load(&self, config: &ServiceConfig) -> Result<ServiceState>;

    /// Save the document for `config` if nobody wrote it since it was loaded.
    ///
    /// On success `state.revision` is advanced to the stored revision.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the stored revision differs from
    /// `state.revision`, or an error if the backing storage fails.
    fn save(&self, config: &ServiceConfig, state: &mut ServiceState) -> Result<()>;
}

/// Load the document, apply `mutate` and save it conditionally.
///
/// # Errors
///
/// Propagates `load` and `save` errors, including `StoreError::Conflict`.
pub fn modify<T>(
    store: &dyn StateStore,
    config: &ServiceConfig,
    mutate: impl FnOnce(&mut ServiceState) -> T,
) -> Result<T> {
    let mut state = store.load(config)?;
    let out = mutate(&mut state);
    store.save(config, &mut state)?;
    Ok(out)
}

/// Compare the stored revision with the one a writer loaded.
pub(crate) fn check_revision(config: &ServiceConfig, stored: u64, loaded: u64) -> Result<()> {
    if stored == loaded {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            key: config.key(),
            expected: loaded,
            found: stored,
        })
    }
}
