//! A metering API that only logs.

use async_trait::async_trait;
use meter_relay_core::MeteringRequest;
use tracing::info;

use crate::error::Result;
use crate::types::MeteringResponse;
use crate::MeteringApi;

/// Logs each payload and reports it as accepted.
///
/// Ledger and cursor advance exactly as they would on a real run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunApi;

#[async_trait]
impl MeteringApi for DryRunApi {
    async fn submit(&self, request: &MeteringRequest) -> Result<MeteringResponse> {
        let payload = serde_json::to_string(request)?;
        info!(
            contract_id = request.entity_id().unwrap_or_default(),
            records = request.len(),
            payload = %payload,
            "DRY RUN: would submit metering request"
        );

        Ok(MeteringResponse::accepted(
            request.request.iter().map(|r| r.contract_id.as_str()),
        ))
    }
}
