//! Error types for meter-relay storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The document changed since it was loaded.
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        /// Service key of the document.
        key: String,
        /// Revision the writer loaded.
        expected: u64,
        /// Revision currently stored.
        found: u64,
    },

    /// The document holds a value that cannot be interpreted.
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
