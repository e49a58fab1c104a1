//! Idempotency ledger for one service and period.
//!
//! The ledger records, per entity, whether a submission was accepted or
//! permanently failed. Every operation reads the whole service document,
//! mutates it and writes it back before returning, so an outcome is durable
//! before the next entity is processed.

use std::sync::Arc;

use chrono::Utc;
use meter_relay_core::{
    DeliveryFailure, ErrorEntry, MeteringRequest, Period, ServiceConfig, ServiceState,
};
use tracing::debug;

use crate::error::Result;
use crate::{modify, StateStore};

/// Ledger view scoped to one `(service, period)`.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StateStore>,
    config: ServiceConfig,
    period: Period,
}

impl Ledger {
    /// Create a ledger for `config` and `period`.
    pub fn new(store: Arc<dyn StateStore>, config: ServiceConfig, period: Period) -> Self {
        Self {
            store,
            config,
            period,
        }
    }

    /// The period this ledger covers.
    #[must_use]
    pub const fn period(&self) -> &Period {
        &self.period
    }

    /// The service this ledger covers.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Snapshot of the full service document.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn snapshot(&self) -> Result<ServiceState> {
        self.store.load(&self.config)
    }

    /// Whether the entity already has a success or error record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_resolved(&self, entity_id: &str) -> Result<bool> {
        Ok(self.snapshot()?.is_resolved(&self.period, entity_id))
    }

    /// Record an accepted submission. Clears any error entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn mark_success(&self, entity_id: &str) -> Result<()> {
        modify(self.store.as_ref(), &self.config, |state| {
            state.mark_success(&self.period, entity_id, Utc::now());
        })?;
        debug!(service = %self.config, period = %self.period, entity_id, "Marked success");
        Ok(())
    }

    /// Record a failed submission with the payload for later retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn mark_error(
        &self,
        entity_id: &str,
        failure: &DeliveryFailure,
        payload: &MeteringRequest,
        retry_count: u32,
    ) -> Result<()> {
        modify(self.store.as_ref(), &self.config, |state| {
            state.mark_error(
                &self.period,
                entity_id,
                failure,
                payload,
                retry_count,
                Utc::now(),
            );
        })?;
        debug!(
            service = %self.config,
            period = %self.period,
            entity_id,
            code = %failure.code,
            retry_count,
            "Marked error"
        );
        Ok(())
    }

    /// Error entries whose retry count is below `max_retries`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn retryable(&self, max_retries: u32) -> Result<Vec<ErrorEntry>> {
        Ok(self.snapshot()?.retryable(&self.period, max_retries))
    }

    /// Delete the entity's error entry. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn remove_error(&self, entity_id: &str) -> Result<bool> {
        modify(self.store.as_ref(), &self.config, |state| {
            state.remove_error(&self.period, entity_id, Utc::now())
        })
    }
}
