//! Ledger and cursor state documents.
//!
//! A `ServiceState` is the single persisted document for one
//! `ServiceConfig`:
//!
//! ```json
//! {
//!   "last_processed_period": "2025-01",
//!   "success": { "2025-02": ["E1"] },
//!   "errors": { "2025-02": [{ "entity_id": "E2", "messages": [], "code": "...",
//!               "message": "...", "retry_count": 5,
//!               "last_attempt_time": "...", "payload": { "request": [] } }] },
//!   "last_updated": "2025-03-01T00:00:00Z",
//!   "revision": 7
//! }
//! ```
//!
//! The mutation methods here keep the ledger invariant: for a given period
//! an entity is recorded as success or as error, never both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MeteringRequest, Period};

/// Why a submission did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    /// Individual error messages.
    pub messages: Vec<String>,
    /// Machine-readable error code.
    pub code: String,
    /// Summary message.
    pub message: String,
}

impl DeliveryFailure {
    /// A failure with a single message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            messages: vec![message.clone()],
            code: code.into(),
            message,
        }
    }

    /// Replace the message list.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<String>) -> Self {
        self.messages = messages;
        self
    }
}

/// A permanent delivery failure for one entity in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// The billing entity.
    pub entity_id: String,

    /// Error messages accumulated across attempts.
    #[serde(default)]
    pub messages: Vec<String>,

    /// Code of the latest failure.
    #[serde(default)]
    pub code: String,

    /// Message of the latest failure.
    #[serde(default)]
    pub message: String,

    /// Retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,

    /// When the latest attempt was made.
    pub last_attempt_time: DateTime<Utc>,

    /// The exact request that failed, for standalone re-submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MeteringRequest>,
}

/// Persisted state for one service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Key of the last fully reconciled period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_period: Option<String>,

    /// Entities delivered successfully, per period key.
    #[serde(default)]
    pub success: BTreeMap<String, Vec<String>>,

    /// Entities with a recorded failure, per period key.
    #[serde(default)]
    pub errors: BTreeMap<String, Vec<ErrorEntry>>,

    /// When the document was last mutated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Write revision used for conditional saves.
    #[serde(default)]
    pub revision: u64,
}

impl ServiceState {
    /// Whether `entity_id` was delivered successfully for `period`.
    #[must_use]
    pub fn is_success(&self, period: &Period, entity_id: &str) -> bool {
        self.success
            .get(&period.key())
            .is_some_and(|entities| entities.iter().any(|e| e == entity_id))
    }

    /// The error entry for `entity_id` in `period`, if any.
    #[must_use]
    pub fn error_entry(&self, period: &Period, entity_id: &str) -> Option<&ErrorEntry> {
        self.errors
            .get(&period.key())
            .and_then(|entries| entries.iter().find(|e| e.entity_id == entity_id))
    }

    /// Whether `entity_id` has any recorded outcome for `period`.
    #[must_use]
    pub fn is_resolved(&self, period: &Period, entity_id: &str) -> bool {
        self.is_success(period, entity_id) || self.error_entry(period, entity_id).is_some()
    }

    /// Entities delivered for `period`.
    #[must_use]
    pub fn successes(&self, period: &Period) -> &[String] {
        self.success.get(&period.key()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Error entries recorded for `period`.
    #[must_use]
    pub fn error_entries(&self, period: &Period) -> &[ErrorEntry] {
        self.errors.get(&period.key()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Error entries for `period` that still have retries left.
    #[must_use]
    pub fn retryable(&self, period: &Period, max_retries: u32) -> Vec<ErrorEntry> {
        self.error_entries(period)
            .iter()
            .filter(|entry| entry.retry_count < max_retries)
            .cloned()
            .collect()
    }

    /// Record a success, clearing any error entry for the entity.
    pub fn mark_success(&mut self, period: &Period, entity_id: &str, now: DateTime<Utc>) {
        self.drop_error(period, entity_id);

        let entities = self.success.entry(period.key()).or_default();
        if !entities.iter().any(|e| e == entity_id) {
            entities.push(entity_id.to_string());
        }
        self.last_updated = Some(now);
    }

    /// Record a failure.
    ///
    /// An existing entry accumulates messages and takes the latest code,
    /// message, payload and retry count. Any success record for the entity
    /// is cleared.
    pub fn mark_error(
        &mut self,
        period: &Period,
        entity_id: &str,
        failure: &DeliveryFailure,
        payload: &MeteringRequest,
        retry_count: u32,
        now: DateTime<Utc>,
    ) {
        self.drop_success(period, entity_id);

        let entries = self.errors.entry(period.key()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.entity_id == entity_id) {
            existing.messages.extend(failure.messages.iter().cloned());
            existing.code.clone_from(&failure.code);
            existing.message.clone_from(&failure.message);
            existing.payload = Some(payload.clone());
            existing.retry_count = retry_count;
            existing.last_attempt_time = now;
        } else {
            entries.push(ErrorEntry {
                entity_id: entity_id.to_string(),
                messages: failure.messages.clone(),
                code: failure.code.clone(),
                message: failure.message.clone(),
                retry_count,
                last_attempt_time: now,
                payload: Some(payload.clone()),
            });
        }
        self.last_updated = Some(now);
    }

    /// Remove the error entry for the entity. Returns whether one existed.
    pub fn remove_error(&mut self, period: &Period, entity_id: &str, now: DateTime<Utc>) -> bool {
        let removed = self.drop_error(period, entity_id);
        if removed {
            self.last_updated = Some(now);
        }
        removed
    }

    /// Record `period` as fully reconciled.
    pub fn set_last_processed(&mut self, period: &Period, now: DateTime<Utc>) {
        self.last_processed_period = Some(period.key());
        self.last_updated = Some(now);
    }

    fn drop_error(&mut self, period: &Period, entity_id: &str) -> bool {
        let key = period.key();
        let Some(entries) = self.errors.get_mut(&key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.entity_id != entity_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.errors.remove(&key);
        }
        removed
    }

    fn drop_success(&mut self, period: &Period, entity_id: &str) {
        let key = period.key();
        if let Some(entities) = self.success.get_mut(&key) {
            entities.retain(|e| e != entity_id);
            if entities.is_empty() {
                self.success.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jan() -> Period {
        Period::month(2025, 1).unwrap()
    }

    fn payload() -> MeteringRequest {
        let dims = [("cpu".to_string(), 4u64)].into_iter().collect();
        MeteringRequest::for_entity("aws", "E1", &dims, &jan())
    }

    #[test]
    fn success_clears_error() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        let failure = DeliveryFailure::new("NETWORK_ERROR", "timeout");

        state.mark_error(&jan(), "E1", &failure, &payload(), 1, now);
        assert!(state.is_resolved(&jan(), "E1"));
        assert!(!state.is_success(&jan(), "E1"));

        state.mark_success(&jan(), "E1", now);
        assert!(state.is_success(&jan(), "E1"));
        assert!(state.error_entry(&jan(), "E1").is_none());
        assert!(state.errors.is_empty());
    }

    #[test]
    fn error_clears_success() {
        let mut state = ServiceState::default();
        let now = Utc::now();

        state.mark_success(&jan(), "E1", now);
        state.mark_error(
            &jan(),
            "E1",
            &DeliveryFailure::new("API_ERROR", "bad"),
            &payload(),
            0,
            now,
        );

        assert!(!state.is_success(&jan(), "E1"));
        assert!(state.success.is_empty());
        assert!(state.error_entry(&jan(), "E1").is_some());
    }

    #[test]
    fn mark_success_is_idempotent() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        state.mark_success(&jan(), "E1", now);
        state.mark_success(&jan(), "E1", now);
        assert_eq!(state.successes(&jan()), ["E1".to_string()]);
    }

    #[test]
    fn repeated_errors_accumulate_messages() {
        let mut state = ServiceState::default();
        let now = Utc::now();

        state.mark_error(
            &jan(),
            "E1",
            &DeliveryFailure::new("NETWORK_ERROR", "first"),
            &payload(),
            1,
            now,
        );
        state.mark_error(
            &jan(),
            "E1",
            &DeliveryFailure::new("API_ERROR", "second"),
            &payload(),
            2,
            now,
        );

        let entry = state.error_entry(&jan(), "E1").unwrap();
        assert_eq!(entry.messages, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(entry.code, "API_ERROR");
        assert_eq!(entry.message, "second");
        assert_eq!(entry.retry_count, 2);
        assert_eq!(state.error_entries(&jan()).len(), 1);
    }

    #[test]
    fn retryable_respects_bound() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        let failure = DeliveryFailure::new("NETWORK_ERROR", "down");

        state.mark_error(&jan(), "E1", &failure, &payload(), 2, now);
        state.mark_error(&jan(), "E2", &failure, &payload(), 5, now);

        let retryable = state.retryable(&jan(), 5);
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].entity_id, "E1");
        assert_eq!(state.retryable(&jan(), 6).len(), 2);
    }

    #[test]
    fn remove_error_reports_presence() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        assert!(!state.remove_error(&jan(), "E1", now));

        state.mark_error(
            &jan(),
            "E1",
            &DeliveryFailure::new("NETWORK_ERROR", "down"),
            &payload(),
            0,
            now,
        );
        assert!(state.remove_error(&jan(), "E1", now));
        assert!(!state.is_resolved(&jan(), "E1"));
    }

    #[test]
    fn document_shape() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        state.mark_success(&jan(), "E1", now);
        state.set_last_processed(&jan(), now);

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["last_processed_period"], json!("2025-01"));
        assert_eq!(value["success"]["2025-01"], json!(["E1"]));
        assert_eq!(value["errors"], json!({}));
        assert_eq!(value["revision"], json!(0));

        let parsed: ServiceState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn tolerates_sparse_documents() {
        let state: ServiceState = serde_json::from_value(json!({
            "errors": {
                "2025-01": [{
                    "entity_id": "E1",
                    "last_attempt_time": "2025-02-01T00:00:00Z"
                }]
            }
        }))
        .unwrap();

        let entry = state.error_entry(&jan(), "E1").unwrap();
        assert_eq!(entry.retry_count, 0);
        assert!(entry.payload.is_none());
        assert!(state.last_processed_period.is_none());
    }
}
