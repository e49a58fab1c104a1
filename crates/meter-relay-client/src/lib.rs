//! Metering API client for meter-relay.
//!
//! Submissions go through the [`MeteringApi`] trait so the delivery engine
//! can run against the real HTTP API, a dry-run logger, or a test double.
//!
//! # Example
//!
//! ```no_run
//! use meter_relay_client::{MeteringApi, MeteringClient};
//! use meter_relay_core::{MeteringRequest, Period};
//! use std::collections::BTreeMap;
//!
//! # async fn example() -> Result<(), meter_relay_client::ClientError> {
//! let client = MeteringClient::connect("https://api.clazar.io", "id", "secret").await?;
//!
//! let period = Period::month(2025, 1).unwrap();
//! let dims = BTreeMap::from([("cpu_core_hours".to_string(), 42)]);
//! let request = MeteringRequest::for_entity("aws", "E1", &dims, &period);
//!
//! let response = client.submit(&request).await?;
//! println!("{:?}", response.outcome()?);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod dry_run;
mod error;
mod types;

pub use client::{MeteringClient, DEFAULT_TIMEOUT};
pub use dry_run::DryRunApi;
pub use error::{ClientError, Result, API_ERROR, NETWORK_ERROR, UNEXPECTED_ERROR};
pub use types::{AuthRequest, AuthResponse, MeteringResponse, MeteringResult, Outcome};

use async_trait::async_trait;
use meter_relay_core::MeteringRequest;

/// Submission endpoint of a metering API.
#[async_trait]
pub trait MeteringApi: Send + Sync {
    /// Submit one entity's records for one period.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-200 status, or a body
    /// that is not a metering response.
    async fn submit(&self, request: &MeteringRequest) -> Result<MeteringResponse>;
}
