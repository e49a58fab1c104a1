//! Reconciliation driver.
//!
//! One step reconciles at most one period for one service:
//!
//! 1. Resubmit retryable failures recorded for the period (phase A).
//! 2. List and read the period's usage files; none means phase A decides.
//! 3. Aggregate, derive configured dimensions, and drop entities the ledger
//!    already resolved.
//! 4. Deliver the rest (phase B).
//!
//! The cursor advances only after the step's outcome allows it.

use std::sync::Arc;

use meter_relay_core::{aggregate, DimensionFormulas, Granularity, Period, ServiceConfig};
use meter_relay_store::{CursorTracker, Ledger, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::engine::DeliveryEngine;
use crate::error::{ReconcileError, Result};
use crate::source::UsageSource;
use crate::watermark::WatermarkSource;

/// When a processed period lets the cursor move past it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Every entity must end the step delivered.
    #[default]
    RequireSuccess,
    /// Every entity must be delivered or have exhausted its retries.
    AllTerminal,
}

/// What a period run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeriodOutcome {
    /// Every entity ended in success.
    delivered: bool,
    /// Usage exists but nothing could be submitted for it.
    blocked: bool,
}

impl PeriodOutcome {
    const fn settled(delivered: bool) -> Self {
        Self {
            delivered,
            blocked: false,
        }
    }
}

/// Drives reconciliation for any number of service configurations.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    usage: Arc<dyn UsageSource>,
    watermark: Arc<dyn WatermarkSource>,
    engine: DeliveryEngine,
    cursor: CursorTracker,
    formulas: DimensionFormulas,
    granularity: Granularity,
    advance_policy: AdvancePolicy,
}

impl Reconciler {
    /// Create a driver for periods of `granularity`.
    pub fn new(
        store: Arc<dyn StateStore>,
        usage: Arc<dyn UsageSource>,
        watermark: Arc<dyn WatermarkSource>,
        engine: DeliveryEngine,
        granularity: Granularity,
    ) -> Self {
        Self {
            cursor: CursorTracker::new(store.clone(), granularity),
            store,
            usage,
            watermark,
            engine,
            formulas: DimensionFormulas::new(),
            granularity,
            advance_policy: AdvancePolicy::default(),
        }
    }

    /// Replace source dimensions with derived ones.
    #[must_use]
    pub fn with_formulas(mut self, formulas: DimensionFormulas) -> Self {
        self.formulas = formulas;
        self
    }

    /// Set the cursor advancement policy.
    #[must_use]
    pub const fn with_advance_policy(mut self, policy: AdvancePolicy) -> Self {
        self.advance_policy = policy;
        self
    }

    /// The cursor tracker.
    #[must_use]
    pub const fn cursor(&self) -> &CursorTracker {
        &self.cursor
    }

    /// The ledger for `config` and `period`.
    #[must_use]
    pub fn ledger(&self, config: &ServiceConfig, period: Period) -> Ledger {
        Ledger::new(self.store.clone(), config.clone(), period)
    }

    /// Reconcile one period without touching the cursor.
    ///
    /// Returns `true` if every retried and every newly submitted entity was
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or written or the
    /// usage partition cannot be listed.
    #[instrument(skip(self, config, period), fields(service = %config, period = %period))]
    pub async fn process_period(
        &self,
        config: &ServiceConfig,
        period: Period,
        max_retries: u32,
    ) -> Result<bool> {
        Ok(self.run_period(config, period, max_retries).await?.delivered)
    }

    /// Reconcile the next period after the cursor, if its data is complete.
    ///
    /// Returns `true` when there was nothing to do or every entity of the
    /// processed period is recorded as delivered. Under
    /// `AdvancePolicy::RequireSuccess` the cursor advances exactly when this
    /// is `true`; under `AdvancePolicy::AllTerminal` it also advances once
    /// every failed entity has exhausted its retries.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` if `default_start` has the
    /// wrong granularity, or any error from reading the watermark or
    /// processing the period. The cursor is untouched on error.
    #[instrument(
        skip(self, config, default_start),
        fields(service = %config, start = %default_start)
    )]
    pub async fn process_next_period(
        &self,
        config: &ServiceConfig,
        max_retries: u32,
        default_start: Period,
    ) -> Result<bool> {
        if default_start.granularity() != self.granularity {
            return Err(ReconcileError::Configuration(format!(
                "start period {default_start} is not {} granularity",
                self.granularity
            )));
        }

        let latest = self
            .watermark
            .last_processed_to(config)
            .await?
            .map(|instant| Period::latest_complete(self.granularity, instant));

        let Some(period) = self.cursor.get_next(config, default_start, latest)? else {
            info!("No complete period to process");
            return Ok(true);
        };

        info!(period = %period, "Processing period");
        let outcome = self.run_period(config, period, max_retries).await?;

        let state = self.store.load(config)?;
        let errors = state.error_entries(&period);
        let delivered = outcome.delivered && errors.is_empty();
        let exhausted = errors
            .iter()
            .all(|entry| entry.payload.is_some() && entry.retry_count >= max_retries);

        let advance = delivered
            || (self.advance_policy == AdvancePolicy::AllTerminal
                && !outcome.blocked
                && exhausted);

        if advance {
            self.cursor.advance(config, &period)?;
            info!(period = %period, delivered, "Period reconciled");
        } else {
            warn!(
                period = %period,
                failed = errors.len(),
                "Period has undelivered usage, cursor not advanced"
            );
        }

        Ok(delivered)
    }

    async fn run_period(
        &self,
        config: &ServiceConfig,
        period: Period,
        max_retries: u32,
    ) -> Result<PeriodOutcome> {
        let ledger = self.ledger(config, period);
        let retried = self.engine.retry_failed(&ledger, max_retries).await?;

        let files = self.usage.list(config, &period).await?;
        if files.is_empty() {
            info!(period = %period, "No usage files for period");
            return Ok(PeriodOutcome::settled(retried));
        }

        let mut records = Vec::new();
        for key in &files {
            match self.usage.read(key).await {
                Ok(batch) => records.extend(batch),
                Err(e) => warn!(file = %key, error = %e, "Skipping unreadable usage file"),
            }
        }

        let aggregated = aggregate(records);
        if aggregated.is_empty() {
            info!(period = %period, files = files.len(), "No usable records for period");
            return Ok(PeriodOutcome::settled(retried));
        }

        let mut usage = self.formulas.derive(&aggregated);
        if usage.is_empty() {
            error!(period = %period, "No entity could be derived, nothing submitted");
            return Ok(PeriodOutcome {
                delivered: false,
                blocked: true,
            });
        }

        let state = ledger.snapshot()?;
        let observed = usage.entities().len();
        usage.retain_entities(|entity| !state.is_resolved(&period, entity));
        let pending = usage.entities().len();
        info!(
            period = %period,
            observed,
            resolved = observed - pending,
            pending,
            "Filtered entities against ledger"
        );

        if usage.is_empty() {
            return Ok(PeriodOutcome::settled(retried));
        }

        let delivered = self.engine.deliver(&ledger, &usage, max_retries).await?;
        Ok(PeriodOutcome::settled(retried && delivered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_policy_default_requires_success() {
        assert_eq!(AdvancePolicy::default(), AdvancePolicy::RequireSuccess);
    }

    #[test]
    fn advance_policy_serde() {
        let policy: AdvancePolicy = serde_json::from_str("\"all_terminal\"").unwrap();
        assert_eq!(policy, AdvancePolicy::AllTerminal);
    }
}
