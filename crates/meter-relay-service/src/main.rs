//! meter-relay - usage metering reconciler
//!
//! Runs one reconciliation step for the configured service and exits
//! non-zero if any entity was left undelivered.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meter_relay_client::{DryRunApi, MeteringApi, MeteringClient};
use meter_relay_service::{
    DeliveryEngine, DirectoryUsageSource, FileWatermarkSource, Reconciler, ReconcilerConfig,
};
use meter_relay_store::FileStateStore;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meter_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting meter-relay");

    // Load configuration from environment
    let config = ReconcilerConfig::from_env()?;

    tracing::info!(
        service = %config.service,
        data_root = %config.data_root.display(),
        state_file = %config.state_file.display(),
        granularity = %config.granularity,
        start = %config.start_period,
        max_retries = config.max_retries,
        advance_policy = ?config.advance_policy,
        dry_run = config.dry_run,
        formulas = config.formulas.len(),
        "Configuration loaded"
    );

    let api: Arc<dyn MeteringApi> = if config.dry_run {
        tracing::warn!("DRY RUN: payloads are logged, not submitted");
        Arc::new(DryRunApi)
    } else {
        let (client_id, client_secret) = config.api.credentials()?;
        let client =
            MeteringClient::connect(config.api.api_url.as_str(), client_id, client_secret).await?;
        tracing::info!(api_url = %client.base_url(), "Authenticated with metering API");
        Arc::new(client)
    };

    let store = Arc::new(FileStateStore::new(&config.state_file));
    let usage = Arc::new(DirectoryUsageSource::new(&config.data_root));
    let watermark = Arc::new(FileWatermarkSource::new(&config.watermark_path));
    let engine = DeliveryEngine::new(api, config.api.cloud.as_str(), config.backoff);

    let reconciler = Reconciler::new(store, usage, watermark, engine, config.granularity)
        .with_formulas(config.formulas.clone())
        .with_advance_policy(config.advance_policy);

    let ok = reconciler
        .process_next_period(&config.service, config.max_retries, config.start_period)
        .await?;

    if ok {
        tracing::info!("Reconciliation step completed");
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("Reconciliation step left undelivered usage");
        Ok(ExitCode::FAILURE)
    }
}
