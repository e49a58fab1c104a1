//! Request and response types for the metering API.

use meter_relay_core::DeliveryFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result, API_ERROR};

/// Body of `POST /authenticate/`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
}

/// Response of `POST /authenticate/`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    /// Bearer token for subsequent calls.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Response of `POST /metering/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringResponse {
    /// Per-record results. Absent on malformed responses.
    #[serde(default)]
    pub results: Option<Vec<MeteringResult>>,
}

/// Result for one submitted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeteringResult {
    /// Contract (entity) the record belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,

    /// Processing status, `"success"` when accepted cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Error details; a list of messages or a single value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,

    /// Error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MeteringResult {
    /// A clean success for `contract_id`.
    #[must_use]
    pub fn success(contract_id: impl Into<String>) -> Self {
        Self {
            contract_id: Some(contract_id.into()),
            status: Some("success".into()),
            ..Self::default()
        }
    }

    /// Whether the result carries any error detail.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        match &self.errors {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }

    fn error_messages(&self) -> Vec<String> {
        match &self.errors {
            Some(Value::Array(items)) => items.iter().map(value_to_message).collect(),
            Some(other) => vec![value_to_message(other)],
            None => Vec::new(),
        }
    }
}

fn value_to_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How a response classifies for one entity's submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted. Non-success statuses are carried as warnings.
    Accepted {
        /// Statuses other than `"success"`.
        warnings: Vec<String>,
    },
    /// Rejected by the API with per-record errors.
    Rejected(DeliveryFailure),
}

impl MeteringResponse {
    /// A response accepting every contract in `contract_ids`.
    #[must_use]
    pub fn accepted<'a>(contract_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            results: Some(contract_ids.into_iter().map(MeteringResult::success).collect()),
        }
    }

    /// Classify the response.
    ///
    /// Any result with errors rejects the submission. Errors from all such
    /// results are collected; the code and message come from the last one.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::UnexpectedResponse` if `results` is absent.
    pub fn outcome(&self) -> Result<Outcome> {
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| ClientError::UnexpectedResponse("missing results".into()))?;

        let rejected: Vec<&MeteringResult> = results.iter().filter(|r| r.has_errors()).collect();
        if let Some(last) = rejected.last() {
            let messages = rejected.iter().flat_map(|r| r.error_messages()).collect();
            let failure = DeliveryFailure {
                messages,
                code: last.code.clone().unwrap_or_else(|| API_ERROR.to_string()),
                message: last
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            };
            return Ok(Outcome::Rejected(failure));
        }

        let warnings = results
            .iter()
            .filter_map(|r| r.status.as_deref())
            .filter(|status| *status != "success")
            .map(str::to_string)
            .collect();
        Ok(Outcome::Accepted { warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> MeteringResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn clean_success() {
        let r = response(json!({"results": [{"contract_id": "E1", "status": "success"}]}));
        assert_eq!(r.outcome().unwrap(), Outcome::Accepted { warnings: vec![] });
    }

    #[test]
    fn warning_status_is_accepted() {
        let r = response(json!({"results": [{"contract_id": "E1", "status": "dimension_not_found"}]}));
        assert_eq!(
            r.outcome().unwrap(),
            Outcome::Accepted {
                warnings: vec!["dimension_not_found".into()]
            }
        );
    }

    #[test]
    fn errors_reject_with_api_code() {
        let r = response(json!({"results": [
            {"contract_id": "E1", "status": "success"},
            {"contract_id": "E1", "errors": ["bad dim", "bad qty"], "code": "INVALID", "message": "nope"},
        ]}));
        let Outcome::Rejected(failure) = r.outcome().unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(failure.code, "INVALID");
        assert_eq!(failure.message, "nope");
        assert_eq!(failure.messages, vec!["bad dim".to_string(), "bad qty".to_string()]);
    }

    #[test]
    fn errors_without_code_use_defaults() {
        let r = response(json!({"results": [{"errors": {"field": "quantity"}}]}));
        let Outcome::Rejected(failure) = r.outcome().unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(failure.code, API_ERROR);
        assert_eq!(failure.message, "Unknown error");
        assert_eq!(failure.messages, vec![r#"{"field":"quantity"}"#.to_string()]);
    }

    #[test]
    fn empty_errors_are_ignored() {
        let r = response(json!({"results": [{"status": "success", "errors": []}]}));
        assert!(matches!(r.outcome().unwrap(), Outcome::Accepted { .. }));
    }

    #[test]
    fn missing_results_is_unexpected() {
        let r = response(json!({"detail": "ok"}));
        assert!(matches!(
            r.outcome(),
            Err(ClientError::UnexpectedResponse(_))
        ));
    }
}
