//! Last-processed-period cursor.
//!
//! The cursor only moves forward. It never names a period past the one the
//! watermark reports as complete.

use std::sync::Arc;

use chrono::Utc;
use meter_relay_core::{Granularity, Period, ServiceConfig};
use tracing::{debug, error, warn};

use crate::error::{Result, StoreError};
use crate::{modify, StateStore};

/// Tracks the last fully reconciled period per service.
#[derive(Clone)]
pub struct CursorTracker {
    store: Arc<dyn StateStore>,
    granularity: Granularity,
}

impl CursorTracker {
    /// Create a tracker for periods of `granularity`.
    pub fn new(store: Arc<dyn StateStore>, granularity: Granularity) -> Self {
        Self { store, granularity }
    }

    /// The last fully reconciled period, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if the stored cursor cannot be parsed
    /// at this tracker's granularity, or an error if the store cannot be read.
    pub fn get_last(&self, config: &ServiceConfig) -> Result<Option<Period>> {
        let state = self.store.load(config)?;
        let Some(key) = state.last_processed_period else {
            return Ok(None);
        };

        Period::parse(self.granularity, &key).map(Some).map_err(|e| {
            error!(service = %config, cursor = %key, error = %e, "Unreadable cursor");
            StoreError::Corrupt(format!("cursor {key:?} for {config}: {e}"))
        })
    }

    /// The next period to reconcile.
    ///
    /// Without a cursor this is `default_start`; otherwise it is the period
    /// after the cursor. Returns `None` when there is no watermark or the
    /// candidate is past `watermark`.
    ///
    /// # Errors
    ///
    /// Propagates `get_last` errors.
    pub fn get_next(
        &self,
        config: &ServiceConfig,
        default_start: Period,
        watermark: Option<Period>,
    ) -> Result<Option<Period>> {
        let Some(latest) = watermark else {
            warn!(service = %config, "No watermark available");
            return Ok(None);
        };

        let candidate = match self.get_last(config)? {
            Some(last) => last.next(),
            None => default_start,
        };

        if candidate > latest {
            debug!(service = %config, next = %candidate, latest = %latest, "Caught up");
            return Ok(None);
        }
        Ok(Some(candidate))
    }

    /// Record `period` as fully reconciled.
    ///
    /// Advancing to the current cursor again only refreshes the update
    /// time. Moving backwards is refused and leaves the cursor unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn advance(&self, config: &ServiceConfig, period: &Period) -> Result<()> {
        let granularity = self.granularity;
        let moved = modify(self.store.as_ref(), config, |state| {
            let current = state
                .last_processed_period
                .as_deref()
                .and_then(|key| Period::parse(granularity, key).ok());
            if current.is_some_and(|current| current > *period) {
                return false;
            }
            state.set_last_processed(period, Utc::now());
            true
        })?;

        if moved {
            debug!(service = %config, period = %period, "Advanced cursor");
        } else {
            warn!(service = %config, period = %period, "Refusing to move cursor backwards");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStateStore;
    use meter_relay_core::ServiceState;

    fn setup() -> (CursorTracker, ServiceConfig, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let tracker = CursorTracker::new(store.clone(), Granularity::Month);
        (tracker, ServiceConfig::new("svc", "env", "plan"), store)
    }

    fn month(m: u32) -> Period {
        Period::month(2025, m).unwrap()
    }

    #[test]
    fn starts_at_default() {
        let (tracker, config, _) = setup();
        assert_eq!(tracker.get_last(&config).unwrap(), None);
        assert_eq!(
            tracker.get_next(&config, month(1), Some(month(3))).unwrap(),
            Some(month(1))
        );
    }

    #[test]
    fn next_follows_cursor() {
        let (tracker, config, _) = setup();
        tracker.advance(&config, &month(2)).unwrap();
        assert_eq!(tracker.get_last(&config).unwrap(), Some(month(2)));
        assert_eq!(
            tracker.get_next(&config, month(1), Some(month(3))).unwrap(),
            Some(month(3))
        );
    }

    #[test]
    fn bounded_by_watermark() {
        let (tracker, config, _) = setup();
        tracker.advance(&config, &month(3)).unwrap();
        assert_eq!(
            tracker.get_next(&config, month(1), Some(month(3))).unwrap(),
            None
        );
        assert_eq!(tracker.get_next(&config, month(1), None).unwrap(), None);
    }

    #[test]
    fn default_start_past_watermark() {
        let (tracker, config, _) = setup();
        assert_eq!(
            tracker.get_next(&config, month(5), Some(month(4))).unwrap(),
            None
        );
    }

    #[test]
    fn advance_is_idempotent_and_monotonic() {
        let (tracker, config, _) = setup();
        tracker.advance(&config, &month(4)).unwrap();
        tracker.advance(&config, &month(4)).unwrap();
        tracker.advance(&config, &month(2)).unwrap();
        assert_eq!(tracker.get_last(&config).unwrap(), Some(month(4)));
    }

    #[test]
    fn unreadable_cursor_is_corrupt() {
        let (tracker, config, store) = setup();
        store.insert(
            &config,
            ServiceState {
                last_processed_period: Some("January".into()),
                ..ServiceState::default()
            },
        );
        assert!(matches!(
            tracker.get_last(&config),
            Err(StoreError::Corrupt(_))
        ));
    }
}
