//! Error types for the reconciliation service.

use meter_relay_client::ClientError;
use meter_relay_core::CoreError;
use meter_relay_store::StoreError;

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Errors that abort a reconciliation step or the whole run.
///
/// Per-entity delivery failures are not errors; they are recorded in the
/// ledger and reported through the step's boolean result.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Ledger or cursor persistence failed.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Usage or watermark data could not be listed or read.
    #[error("source error: {0}")]
    Source(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Setting up the metering API failed.
    #[error("metering API error: {0}")]
    Client(#[from] ClientError),

    /// Invalid period, granularity or formula.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<std::io::Error> for ReconcileError {
    fn from(e: std::io::Error) -> Self {
        Self::Source(e.to_string())
    }
}
