//! Error types for meter-relay core.

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// A period key or period component is out of range.
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    /// Unknown period granularity name.
    #[error("invalid granularity: {0}")]
    InvalidGranularity(String),

    /// A raw usage record is missing a required field or has a bad quantity.
    #[error("malformed usage record: {0}")]
    MalformedRecord(String),

    /// A derived-dimension formula could not be parsed.
    #[error("formula syntax error in '{formula}': {message}")]
    FormulaSyntax {
        /// The formula source text.
        formula: String,
        /// What went wrong.
        message: String,
    },

    /// A derived-dimension formula failed to produce a usable value.
    #[error("formula evaluation error: {0}")]
    FormulaEvaluation(String),
}
