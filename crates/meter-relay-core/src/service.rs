//! Service configuration scope.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Period;

/// Root prefix of the usage export inside the bucket.
pub const EXPORT_ROOT: &str = "omnistrate-metering";

/// The unit of independent processing.
///
/// All ledger and cursor state is scoped under this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name of the metered service.
    pub service_name: String,
    /// Environment type (e.g. `PROD`).
    pub environment: String,
    /// Plan identifier.
    pub plan_id: String,
}

impl ServiceConfig {
    /// Create a new service configuration.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        environment: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            environment: environment.into(),
            plan_id: plan_id.into(),
        }
    }

    /// The key used in state and watermark documents: `service:environment:plan`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.service_name, self.environment, self.plan_id)
    }

    /// Storage prefix holding the usage files of one period.
    #[must_use]
    pub fn partition_prefix(&self, period: &Period) -> String {
        format!(
            "{EXPORT_ROOT}/{}/{}/{}/{}",
            self.service_name,
            self.environment,
            self.plan_id,
            period.partition_prefix()
        )
    }
}

impl fmt::Display for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service_name, self.environment, self.plan_id)
    }
}
