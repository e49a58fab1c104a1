//! Delivery engine.
//!
//! Turns aggregated usage into one submission per entity and reconciles the
//! outcome into the ledger. Submissions are strictly sequential. A failed
//! attempt is retried with exponential backoff; once attempts are exhausted
//! the failure is recorded with its exact payload so a later retry pass can
//! resubmit it without re-aggregating.

use std::sync::Arc;
use std::time::Duration;

use meter_relay_client::{MeteringApi, Outcome};
use meter_relay_core::{build_requests, AggregatedQuantity, DeliveryFailure, MeteringRequest};
use meter_relay_store::Ledger;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Exponential backoff between delivery attempts.
///
/// The retry bound is not part of the backoff: callers pass `max_retries`
/// to each delivery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay; attempt `k` waits `2^k` units.
    pub unit: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Create a backoff with the given base delay.
    #[must_use]
    pub const fn new(unit: Duration) -> Self {
        Self { unit }
    }

    /// Delay before attempt `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Submits usage to the metering API and records outcomes in the ledger.
#[derive(Clone)]
pub struct DeliveryEngine {
    api: Arc<dyn MeteringApi>,
    cloud: String,
    backoff: Backoff,
}

impl DeliveryEngine {
    /// Create an engine submitting for `cloud` marketplace contracts.
    pub fn new(api: Arc<dyn MeteringApi>, cloud: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            api,
            cloud: cloud.into(),
            backoff,
        }
    }

    /// The backoff in use.
    #[must_use]
    pub const fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Submit every entity in `usage` for the ledger's period.
    ///
    /// Each entity gets up to `max_retries + 1` attempts. Returns `true` only
    /// if every entity ended in success.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be read or written.
    pub async fn deliver(
        &self,
        ledger: &Ledger,
        usage: &AggregatedQuantity,
        max_retries: u32,
    ) -> Result<bool> {
        let mut all_success = true;

        for (entity_id, request) in build_requests(&self.cloud, usage, ledger.period()) {
            if !self.deliver_entity(ledger, &entity_id, &request, max_retries).await? {
                all_success = false;
            }
        }

        Ok(all_success)
    }

    async fn deliver_entity(
        &self,
        ledger: &Ledger,
        entity_id: &str,
        request: &MeteringRequest,
        max_retries: u32,
    ) -> Result<bool> {
        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }

            match self.attempt(request).await {
                Ok(warnings) => {
                    log_warnings(entity_id, &warnings);
                    ledger.mark_success(entity_id)?;
                    info!(period = %ledger.period(), entity_id, attempt, "Delivered usage");
                    return Ok(true);
                }
                Err(failure) if attempt == max_retries => {
                    error!(
                        period = %ledger.period(),
                        entity_id,
                        code = %failure.code,
                        message = %failure.message,
                        "Delivery failed after final attempt"
                    );
                    ledger.mark_error(entity_id, &failure, request, max_retries)?;
                }
                Err(failure) => {
                    warn!(
                        period = %ledger.period(),
                        entity_id,
                        attempt,
                        code = %failure.code,
                        message = %failure.message,
                        "Delivery attempt failed"
                    );
                }
            }
        }

        Ok(false)
    }

    /// Resubmit the stored payload of every retryable error entry.
    ///
    /// An entry at retry count `r` gets attempts `r + 1 ..= max_retries`,
    /// each preceded by a `2^attempt` backoff, and each failure is recorded
    /// with the attempt number. Returns `true` if there was nothing to retry
    /// or every retried entity succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be read or written.
    pub async fn retry_failed(&self, ledger: &Ledger, max_retries: u32) -> Result<bool> {
        let entries = ledger.retryable(max_retries)?;
        if entries.is_empty() {
            debug!(period = %ledger.period(), "No failed entities to retry");
            return Ok(true);
        }

        info!(period = %ledger.period(), count = entries.len(), "Retrying failed entities");
        let mut all_success = true;

        for entry in entries {
            let Some(payload) = entry.payload.as_ref() else {
                warn!(
                    period = %ledger.period(),
                    entity_id = %entry.entity_id,
                    "Error entry has no payload, cannot retry"
                );
                all_success = false;
                continue;
            };

            let mut delivered = false;
            for attempt in entry.retry_count + 1..=max_retries {
                tokio::time::sleep(self.backoff.delay(attempt)).await;

                match self.attempt(payload).await {
                    Ok(warnings) => {
                        log_warnings(&entry.entity_id, &warnings);
                        ledger.mark_success(&entry.entity_id)?;
                        info!(
                            period = %ledger.period(),
                            entity_id = %entry.entity_id,
                            attempt,
                            "Retry succeeded"
                        );
                        delivered = true;
                        break;
                    }
                    Err(failure) => {
                        warn!(
                            period = %ledger.period(),
                            entity_id = %entry.entity_id,
                            attempt,
                            max_retries,
                            code = %failure.code,
                            "Retry failed"
                        );
                        ledger.mark_error(&entry.entity_id, &failure, payload, attempt)?;
                    }
                }
            }

            if !delivered {
                all_success = false;
            }
        }

        Ok(all_success)
    }

    /// One submission. `Ok` carries any warning statuses.
    async fn attempt(
        &self,
        request: &MeteringRequest,
    ) -> std::result::Result<Vec<String>, DeliveryFailure> {
        let response = self
            .api
            .submit(request)
            .await
            .map_err(|e| e.to_failure())?;

        match response.outcome().map_err(|e| e.to_failure())? {
            Outcome::Accepted { warnings } => Ok(warnings),
            Outcome::Rejected(failure) => Err(failure),
        }
    }
}

fn log_warnings(entity_id: &str, warnings: &[String]) {
    for status in warnings {
        warn!(
            entity_id,
            status = %status,
            "Accepted with warning status, check that the dimension is registered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_millis(10));
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(80));
    }

    #[test]
    fn delay_saturates() {
        let backoff = Backoff::new(Duration::from_secs(1));
        assert_eq!(backoff.delay(200), Duration::from_secs(1).saturating_mul(u32::MAX));
    }

    #[test]
    fn default_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
    }
}
