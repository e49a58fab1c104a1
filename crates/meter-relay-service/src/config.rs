//! Reconciler configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use meter_relay_core::{DimensionFormulas, Granularity, Period, ServiceConfig};
use serde::Deserialize;

use crate::engine::Backoff;
use crate::error::{ReconcileError, Result};
use crate::reconcile::AdvancePolicy;

/// Default metering API URL.
pub const DEFAULT_API_URL: &str = "https://api.clazar.io";

/// Number of `DIMENSION{i}_NAME` / `DIMENSION{i}_FORMULA` slots.
pub const DIMENSION_SLOTS: usize = 3;

/// Metering API connection settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// API base URL (default: `https://api.clazar.io`).
    pub api_url: String,
    /// OAuth client id.
    pub client_id: Option<String>,
    /// OAuth client secret.
    pub client_secret: Option<String>,
    /// Marketplace cloud of the contracts (default: "aws").
    pub cloud: String,
}

impl ApiConfig {
    /// The client id and secret.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` if either is missing.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
            _ => Err(ReconcileError::Configuration(
                "CLAZAR_CLIENT_ID and CLAZAR_CLIENT_SECRET are required".into(),
            )),
        }
    }
}

/// Configuration for one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// The service configuration to reconcile.
    pub service: ServiceConfig,

    /// Local root of the usage export layout.
    pub data_root: PathBuf,

    /// Ledger and cursor document (default: `<data_root>/metering_state.json`).
    pub state_file: PathBuf,

    /// Watermark document (default: `<data_root>/omnistrate-metering/last_success_export.json`).
    pub watermark_path: PathBuf,

    /// Period length (default: month).
    pub granularity: Granularity,

    /// First period to reconcile when there is no cursor.
    pub start_period: Period,

    /// Retries after the first delivery attempt (default: 5).
    pub max_retries: u32,

    /// Delay between delivery attempts (default unit: one second).
    pub backoff: Backoff,

    /// Cursor advancement policy.
    pub advance_policy: AdvancePolicy,

    /// Log payloads instead of submitting them.
    pub dry_run: bool,

    /// Metering API settings.
    pub api: ApiConfig,

    /// Derived dimensions replacing the source ones.
    pub formulas: DimensionFormulas,
}

/// Metering API secrets file structure.
#[derive(Debug, Deserialize)]
struct ClazarSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    api_url: Option<String>,
}

impl ReconcilerConfig {
    /// Load configuration from environment variables and secrets files.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` if a required variable is
    /// missing or any value is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_vars(|key| std::env::var(key).ok())?;

        if let Some(secrets) = load_clazar_secrets() {
            config.api.client_id = Some(secrets.client_id);
            config.api.client_secret = Some(secrets.client_secret);
            if let Some(url) = secrets.api_url {
                config.api.api_url = url;
            }
        }

        Ok(config)
    }

    /// Build configuration from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` if a required variable is
    /// missing or any value is invalid.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| {
            var(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| {
            lookup(key)
                .ok_or_else(|| ReconcileError::Configuration(format!("{key} is required")))
        };

        let service = ServiceConfig::new(
            required("SERVICE_NAME")?,
            required("ENVIRONMENT_TYPE")?,
            required("PLAN_ID")?,
        );

        let data_root = PathBuf::from(required("DATA_ROOT")?);
        let state_file = lookup("STATE_FILE_PATH")
            .map_or_else(|| data_root.join("metering_state.json"), PathBuf::from);
        let watermark_path = lookup("WATERMARK_PATH").map_or_else(
            || data_root.join("omnistrate-metering/last_success_export.json"),
            PathBuf::from,
        );

        let granularity = parse_or(
            lookup("PERIOD_GRANULARITY"),
            "PERIOD_GRANULARITY",
            Granularity::Month,
        )?;
        let start_key = lookup("START_PERIOD")
            .or_else(|| lookup("START_MONTH"))
            .unwrap_or_else(|| default_start_key(granularity).to_string());
        let start_period = Period::parse(granularity, &start_key)
            .map_err(|e| ReconcileError::Configuration(format!("START_PERIOD: {e}")))?;

        let max_retries = parse_or(lookup("MAX_RETRIES"), "MAX_RETRIES", 5)?;
        let backoff = Backoff::new(Duration::from_millis(parse_or(
            lookup("BACKOFF_UNIT_MS"),
            "BACKOFF_UNIT_MS",
            1000,
        )?));

        let advance_policy = if flag(lookup("ADVANCE_ON_EXHAUSTED")) {
            AdvancePolicy::AllTerminal
        } else {
            AdvancePolicy::RequireSuccess
        };

        let api = ApiConfig {
            api_url: lookup("CLAZAR_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            client_id: lookup("CLAZAR_CLIENT_ID"),
            client_secret: lookup("CLAZAR_CLIENT_SECRET"),
            cloud: lookup("CLAZAR_CLOUD").unwrap_or_else(|| "aws".to_string()),
        };

        Ok(Self {
            service,
            data_root,
            state_file,
            watermark_path,
            granularity,
            start_period,
            max_retries,
            backoff,
            advance_policy,
            dry_run: flag(lookup("DRY_RUN")),
            api,
            formulas: load_formulas(&lookup)?,
        })
    }
}

fn default_start_key(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Month => "2025-01",
        Granularity::Hour => "2025-01-01T00",
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|e| ReconcileError::Configuration(format!("{key}={raw:?}: {e}")))
    })
}

fn flag(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

fn load_formulas(lookup: &impl Fn(&str) -> Option<String>) -> Result<DimensionFormulas> {
    let mut formulas = DimensionFormulas::new();

    for slot in 1..=DIMENSION_SLOTS {
        let name_key = format!("DIMENSION{slot}_NAME");
        let formula_key = format!("DIMENSION{slot}_FORMULA");

        match (lookup(&name_key), lookup(&formula_key)) {
            (Some(name), Some(formula)) => {
                formulas
                    .insert(name, &formula)
                    .map_err(|e| ReconcileError::Configuration(format!("{formula_key}: {e}")))?;
            }
            (None, None) => {}
            _ => {
                return Err(ReconcileError::Configuration(format!(
                    "{name_key} and {formula_key} must be set together"
                )))
            }
        }
    }

    if !formulas.is_empty() {
        tracing::info!(count = formulas.len(), "Loaded dimension formulas");
    }
    Ok(formulas)
}

/// Load metering API secrets from the first secrets file found.
fn load_clazar_secrets() -> Option<ClazarSecrets> {
    let secret_paths = [".secrets/clazar.json", "../.secrets/clazar.json"];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<ClazarSecrets>(path) {
            tracing::info!(path = %path, "Loaded metering API secrets from file");
            return Some(secrets);
        }
    }

    tracing::debug!("Metering API secrets file not found, using environment variables");
    None
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> std::io::Result<T> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
