//! Metering submission payloads.
//!
//! One `MeteringRequest` is built per entity and carries one
//! `MeteringRecord` per dimension. Failed requests are stored verbatim in
//! the ledger so they can be re-sent without re-aggregating.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregatedQuantity, Period};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One `(entity, dimension)` usage line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringRecord {
    /// Cloud marketplace name (e.g. `aws`).
    pub cloud: String,
    /// The billing entity.
    pub contract_id: String,
    /// The usage dimension.
    pub dimension: String,
    /// Period start, `YYYY-MM-DDTHH:MM:SSZ`.
    pub start_time: String,
    /// Last second of the period, `YYYY-MM-DDTHH:MM:SSZ`.
    pub end_time: String,
    /// Whole units as a decimal string.
    pub quantity: String,
}

/// Submission body: all dimensions of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringRequest {
    /// Usage lines.
    pub request: Vec<MeteringRecord>,
}

impl MeteringRequest {
    /// Build the request for one entity over one period.
    #[must_use]
    pub fn for_entity(
        cloud: &str,
        entity_id: &str,
        dimensions: &BTreeMap<String, u64>,
        period: &Period,
    ) -> Self {
        let start_time = format_time(period.start());
        let end_time = format_time(period.end());

        let request = dimensions
            .iter()
            .map(|(dimension, quantity)| MeteringRecord {
                cloud: cloud.to_string(),
                contract_id: entity_id.to_string(),
                dimension: dimension.clone(),
                start_time: start_time.clone(),
                end_time: end_time.clone(),
                quantity: quantity.to_string(),
            })
            .collect();

        Self { request }
    }

    /// The entity this request is for, taken from its first record.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.request.first().map(|r| r.contract_id.as_str())
    }

    /// Number of usage lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.request.len()
    }

    /// Whether the request carries no usage lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }
}

/// Build one request per entity, in entity order.
#[must_use]
pub fn build_requests(
    cloud: &str,
    aggregated: &AggregatedQuantity,
    period: &Period,
) -> Vec<(String, MeteringRequest)> {
    aggregated
        .by_entity()
        .into_iter()
        .map(|(entity_id, dimensions)| {
            let request = MeteringRequest::for_entity(cloud, &entity_id, &dimensions, period);
            (entity_id, request)
        })
        .collect()
}

fn format_time(instant: DateTime<Utc>) -> String {
    instant.format(TIME_FORMAT).to_string()
}
