//! Usage reconciliation driver for meter-relay.
//!
//! Reconciles usage exported into time-partitioned storage into metering
//! API submissions, one period per step, so that every
//! `(entity, dimension, period)` is submitted effectively once across
//! repeated, resumable runs.
//!
//! # Components
//!
//! - [`Reconciler`]: picks the next complete period, retries recorded
//!   failures, aggregates fresh usage and advances the cursor.
//! - [`DeliveryEngine`]: per-entity submission with bounded retries and
//!   exponential backoff.
//! - [`UsageSource`] and [`WatermarkSource`]: read-only views of the export
//!   pipeline's output.
//!
//! Runs against the same service configuration must not overlap; the
//! state store reports an overlapping write as a revision conflict.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod source;
pub mod watermark;

pub use config::{ApiConfig, ReconcilerConfig};
pub use engine::{Backoff, DeliveryEngine};
pub use error::{ReconcileError, Result};
pub use reconcile::{AdvancePolicy, Reconciler};
pub use source::{DirectoryUsageSource, MemoryUsageSource, UsageSource};
pub use watermark::{FileWatermarkSource, MemoryWatermarkSource, WatermarkSource};
