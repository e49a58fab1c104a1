//! Shared fixtures for reconciliation tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use meter_relay_client::{ClientError, MeteringApi, MeteringResponse, MeteringResult};
use meter_relay_core::{MeteringRequest, Period, RawUsageRecord, ServiceConfig};
use meter_relay_service::{
    Backoff, DeliveryEngine, MemoryUsageSource, MemoryWatermarkSource, Reconciler,
};
use meter_relay_store::MemoryStateStore;

/// One scripted API reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Warn(&'static str),
    Reject(&'static str),
    Status(u16),
    Malformed,
}

/// Metering API double that replays scripted replies per entity.
///
/// Entities without a script (or with an exhausted one) are accepted.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<MeteringRequest>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, entity: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(entity.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<MeteringRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, entity: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.entity_id() == Some(entity))
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl MeteringApi for ScriptedApi {
    async fn submit(&self, request: &MeteringRequest) -> Result<MeteringResponse, ClientError> {
        self.calls.lock().unwrap().push(request.clone());

        let entity = request.entity_id().unwrap_or_default().to_string();
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&entity)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Accept);

        match reply {
            Reply::Accept => Ok(MeteringResponse::accepted([entity.as_str()])),
            Reply::Warn(status) => Ok(MeteringResponse {
                results: Some(vec![MeteringResult {
                    contract_id: Some(entity),
                    status: Some(status.to_string()),
                    ..MeteringResult::default()
                }]),
            }),
            Reply::Reject(code) => Ok(serde_json::from_value(json!({
                "results": [{
                    "contract_id": entity,
                    "errors": ["rejected"],
                    "code": code,
                    "message": "Rejected by API",
                }]
            }))
            .unwrap()),
            Reply::Status(status) => Err(ClientError::Status {
                status,
                body: "unavailable".into(),
            }),
            Reply::Malformed => Ok(MeteringResponse { results: None }),
        }
    }
}

/// Everything a reconciliation test touches.
pub struct Harness {
    pub config: ServiceConfig,
    pub store: Arc<MemoryStateStore>,
    pub usage: Arc<MemoryUsageSource>,
    pub watermark: Arc<MemoryWatermarkSource>,
    pub api: Arc<ScriptedApi>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|reconciler| reconciler)
    }

    pub fn with(customize: impl FnOnce(Reconciler) -> Reconciler) -> Self {
        let config = ServiceConfig::new("Postgres", "PROD", "pt-1");
        let store = Arc::new(MemoryStateStore::new());
        let usage = Arc::new(MemoryUsageSource::new());
        let watermark = Arc::new(MemoryWatermarkSource::new());
        let api = Arc::new(ScriptedApi::new());

        let engine = DeliveryEngine::new(api.clone(), "aws", fast_backoff());
        let reconciler = customize(Reconciler::new(
            store.clone(),
            usage.clone(),
            watermark.clone(),
            engine,
            meter_relay_core::Granularity::Month,
        ));

        Self {
            config,
            store,
            usage,
            watermark,
            api,
            reconciler,
        }
    }

    pub fn add_usage(&self, period: &Period, name: &str, records: &[(&str, &str, u64)]) {
        let records: Vec<RawUsageRecord> = records
            .iter()
            .map(|(entity, dimension, value)| RawUsageRecord::new(entity, dimension, *value))
            .collect();
        self.usage.add_records(&self.config, period, name, &records);
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(1))
}

pub fn month(year: i32, month: u32) -> Period {
    Period::month(year, month).unwrap()
}
