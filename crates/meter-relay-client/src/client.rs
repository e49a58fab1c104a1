//! Metering API HTTP client implementation.

use std::time::Duration;

use async_trait::async_trait;
use meter_relay_core::MeteringRequest;
use reqwest::Client;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::types::{AuthRequest, AuthResponse, MeteringResponse};
use crate::MeteringApi;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Metering API client.
#[derive(Debug, Clone)]
pub struct MeteringClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl MeteringClient {
    /// Create a new metering client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API URL (e.g., `"https://api.clazar.io"`)
    /// * `access_token` - Bearer token from [`MeteringClient::authenticate`]
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, access_token, DEFAULT_TIMEOUT)
    }

    /// Create a new metering client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn with_timeout(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: normalize(base_url.into()),
            access_token: access_token.into(),
        })
    }

    /// Exchange client credentials for an access token.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Authentication` if the credentials are rejected
    /// or no token is issued, or `ClientError::Http` on transport failure.
    pub async fn authenticate(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<String> {
        let client = build_http_client(DEFAULT_TIMEOUT)?;
        let url = format!("{}/authenticate/", normalize(base_url.into()));
        let request = AuthRequest {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        };

        let response = client
            .post(&url)
            .header("accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Authentication(format!("HTTP {status}: {body}")));
        }

        let auth: AuthResponse = response.json().await?;
        auth.access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ClientError::Authentication("no access token received".into()))
    }

    /// Authenticate and build a client in one step.
    ///
    /// # Errors
    ///
    /// Returns any error from [`MeteringClient::authenticate`] or
    /// [`MeteringClient::new`].
    pub async fn connect(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let token = Self::authenticate(base_url.clone(), client_id, client_secret).await?;
        Self::new(base_url, token)
    }

    /// Base URL with any trailing slash removed.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Handle API response and convert errors.
    async fn handle_response(&self, response: reqwest::Response) -> Result<MeteringResponse> {
        let status = response.status();
        let body = response.text().await?;

        if status != reqwest::StatusCode::OK {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MeteringApi for MeteringClient {
    async fn submit(&self, request: &MeteringRequest) -> Result<MeteringResponse> {
        let url = format!("{}/metering/", self.base_url);
        debug!(
            url = %url,
            contract_id = request.entity_id().unwrap_or_default(),
            records = request.len(),
            "Submitting metering request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("accept", "application/json")
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }
}

fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))
}

fn normalize(base_url: String) -> String {
    base_url.trim_end_matches('/').to_string()
}
