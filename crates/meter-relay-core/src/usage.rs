//! Usage records and their aggregation.
//!
//! Raw records arrive as JSON objects produced by the ingestion pipeline.
//! `aggregate` reduces any number of them into per-entity, per-dimension
//! totals for one period. The reduction is a plain sum, so the result does
//! not depend on record order or on how records were split across files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// A usage record as read from storage, before validation.
///
/// Deserialization never fails for a single element: any JSON value becomes
/// a `RawUsageRecord`, and type problems surface from `validate`. A file
/// with one bad record still yields its good ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct RawUsageRecord {
    /// The billing entity (external payer).
    #[serde(rename = "externalPayerId", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<serde_json::Value>,

    /// The usage dimension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<serde_json::Value>,

    /// The quantity, as any JSON value.
    #[serde(rename = "value", skip_serializing_if = "Option::is_none")]
    pub quantity: Option<serde_json::Value>,
}

impl From<serde_json::Value> for RawUsageRecord {
    fn from(value: serde_json::Value) -> Self {
        let serde_json::Value::Object(fields) = value else {
            return Self::default();
        };
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| fields.get(*name))
                .filter(|value| !value.is_null())
                .cloned()
        };
        Self {
            entity_id: field(&["externalPayerId", "entity_id"]),
            dimension: field(&["dimension"]),
            quantity: field(&["value", "quantity"]),
        }
    }
}

impl RawUsageRecord {
    /// A well-typed record.
    #[must_use]
    pub fn new(entity_id: &str, dimension: &str, quantity: u64) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            dimension: Some(dimension.into()),
            quantity: Some(quantity.into()),
        }
    }

    /// Validate the record into a `UsageRecord`.
    ///
    /// A missing quantity counts as zero. Fractional quantities are
    /// truncated toward zero.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedRecord` if the entity or dimension is
    /// missing, empty or not a string, or the quantity is negative or not a
    /// number.
    pub fn validate(self) -> Result<UsageRecord> {
        let entity_id = required_string(self.entity_id, "entity id")?;
        let dimension = required_string(self.dimension, "dimension")?;
        let quantity = match self.quantity {
            None | Some(serde_json::Value::Null) => 0,
            Some(value) => parse_quantity(&value)?,
        };

        Ok(UsageRecord {
            entity_id,
            dimension,
            quantity,
        })
    }
}

fn required_string(value: Option<serde_json::Value>, field: &str) -> Result<String> {
    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s),
        None | Some(serde_json::Value::Null) => {
            Err(CoreError::MalformedRecord(format!("missing {field}")))
        }
        Some(serde_json::Value::String(_)) => {
            Err(CoreError::MalformedRecord(format!("empty {field}")))
        }
        Some(other) => Err(CoreError::MalformedRecord(format!("invalid {field}: {other}"))),
    }
}

/// A validated usage fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// The billing entity.
    pub entity_id: String,
    /// The usage dimension.
    pub dimension: String,
    /// Whole units consumed.
    pub quantity: u64,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_quantity(value: &serde_json::Value) -> Result<u64> {
    let invalid = || CoreError::MalformedRecord(format!("invalid quantity: {value}"));
    let number = match value {
        serde_json::Value::Number(n) => {
            if let Some(whole) = n.as_u64() {
                return Ok(whole);
            }
            n.as_f64().ok_or_else(invalid)?
        }
        serde_json::Value::String(s) => {
            if let Ok(whole) = s.trim().parse::<u64>() {
                return Ok(whole);
            }
            s.trim().parse::<f64>().map_err(|_| invalid())?
        }
        _ => return Err(invalid()),
    };

    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }
    Ok(number.trunc() as u64)
}

/// Summed usage for one period, keyed by `(entity_id, dimension)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedQuantity {
    totals: BTreeMap<(String, String), u64>,
}

impl AggregatedQuantity {
    /// Create an empty aggregation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a quantity to the `(entity, dimension)` total.
    pub fn add(&mut self, entity_id: &str, dimension: &str, quantity: u64) {
        let total = self
            .totals
            .entry((entity_id.to_string(), dimension.to_string()))
            .or_insert(0);
        *total = total.saturating_add(quantity);
    }

    /// Overwrite the `(entity, dimension)` total.
    pub fn set(&mut self, entity_id: &str, dimension: &str, quantity: u64) {
        self.totals
            .insert((entity_id.to_string(), dimension.to_string()), quantity);
    }

    /// Get the total for `(entity, dimension)`.
    #[must_use]
    pub fn get(&self, entity_id: &str, dimension: &str) -> Option<u64> {
        self.totals
            .get(&(entity_id.to_string(), dimension.to_string()))
            .copied()
    }

    /// Number of `(entity, dimension)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Iterate entries in `(entity, dimension)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.totals
            .iter()
            .map(|((entity, dimension), quantity)| (entity.as_str(), dimension.as_str(), *quantity))
    }

    /// Distinct entity ids, in order.
    #[must_use]
    pub fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self.totals.keys().map(|(e, _)| e.clone()).collect();
        entities.dedup();
        entities
    }

    /// Group totals by entity: `entity -> dimension -> quantity`.
    #[must_use]
    pub fn by_entity(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        let mut grouped: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for ((entity, dimension), quantity) in &self.totals {
            grouped
                .entry(entity.clone())
                .or_default()
                .insert(dimension.clone(), *quantity);
        }
        grouped
    }

    /// Keep only the entries whose entity satisfies `keep`.
    pub fn retain_entities(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.totals.retain(|(entity, _), _| keep(entity));
    }
}

impl FromIterator<UsageRecord> for AggregatedQuantity {
    fn from_iter<I: IntoIterator<Item = UsageRecord>>(iter: I) -> Self {
        let mut aggregated = Self::new();
        for record in iter {
            aggregated.add(&record.entity_id, &record.dimension, record.quantity);
        }
        aggregated
    }
}

/// Reduce raw records into per-entity, per-dimension totals.
///
/// Malformed records are dropped with a warning.
pub fn aggregate<I>(records: I) -> AggregatedQuantity
where
    I: IntoIterator<Item = RawUsageRecord>,
{
    let mut aggregated = AggregatedQuantity::new();
    let mut seen = 0usize;
    let mut skipped = 0usize;

    for raw in records {
        seen += 1;
        let snapshot = raw.clone();
        match raw.validate() {
            Ok(record) => aggregated.add(&record.entity_id, &record.dimension, record.quantity),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, record = ?snapshot, "Skipping usage record");
            }
        }
    }

    debug!(
        records = seen,
        skipped,
        entries = aggregated.len(),
        "Aggregated usage records"
    );
    aggregated
}
