//! Client error types.

use meter_relay_core::DeliveryFailure;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Ledger code for transport failures and non-200 responses.
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";

/// Ledger code for responses that could not be interpreted.
pub const UNEXPECTED_ERROR: &str = "UNEXPECTED_ERROR";

/// Ledger code for per-entity API errors without a code of their own.
pub const API_ERROR: &str = "API_ERROR";

/// Errors that can occur when talking to the metering API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-200 status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Response was valid JSON but not the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credentials were rejected or no token was issued.
    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ClientError {
    /// Ledger code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Http(_) | Self::Status { .. } => NETWORK_ERROR,
            Self::UnexpectedResponse(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Authentication(_) => UNEXPECTED_ERROR,
        }
    }

    /// Convert into a ledger failure record.
    #[must_use]
    pub fn to_failure(&self) -> DeliveryFailure {
        DeliveryFailure::new(self.code(), self.to_string())
    }
}
