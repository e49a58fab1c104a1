//! Core types and utilities for meter-relay.
//!
//! This crate provides the foundational types used throughout the reconciler:
//!
//! - **Scope**: `ServiceConfig`, the unit of independent processing
//! - **Periods**: `Period`, `Granularity`
//! - **Usage**: `RawUsageRecord`, `UsageRecord`, `AggregatedQuantity`, `aggregate`
//! - **Derived dimensions**: `Formula`, `DimensionFormulas`
//! - **Submissions**: `MeteringRecord`, `MeteringRequest`
//! - **Ledger documents**: `ServiceState`, `ErrorEntry`, `DeliveryFailure`
//!
//! # Quantities
//!
//! Usage quantities are whole units stored as `u64`. Fractional inputs are
//! truncated toward zero when a record is read, and derived dimensions are
//! truncated after evaluation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod formula;
pub mod period;
pub mod service;
pub mod state;
pub mod submission;
pub mod usage;

pub use error::{CoreError, Result};
pub use formula::{DimensionFormulas, Formula, ALLOWED_INPUTS, MAX_FORMULA_LEN, MAX_NESTING};
pub use period::{Granularity, Period};
pub use service::ServiceConfig;
pub use state::{DeliveryFailure, ErrorEntry, ServiceState};
pub use submission::{build_requests, MeteringRecord, MeteringRequest};
pub use usage::{aggregate, AggregatedQuantity, RawUsageRecord, UsageRecord};
