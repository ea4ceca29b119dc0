// =============================================================================
// APPS SCRIPT EXECUTION CLIENT
// =============================================================================
//
// Implements the core `ScriptRunner` trait against the Apps Script API
// `scripts.run` method. Functions run in dev mode so the latest saved code
// executes without needing a new deployment version.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::retrieval::{ExecutionRecord, RetrievalError, ScriptError, ScriptRunner, StackFrame};
use crate::infra::google_auth::{AuthError, GoogleAuthClient};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    function: &'a str,
    dev_mode: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunOperation {
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<OperationResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationError {
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    script_stack_trace_elements: Vec<TraceElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceElement {
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    line_number: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

impl OperationError {
    fn into_script_error(self) -> ScriptError {
        let detail = self.details.into_iter().next().unwrap_or(ErrorDetail {
            error_message: None,
            error_type: None,
            script_stack_trace_elements: Vec::new(),
        });
        ScriptError {
            message: detail
                .error_message
                .unwrap_or_else(|| "unknown script error".to_string()),
            error_type: detail
                .error_type
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            stack: detail
                .script_stack_trace_elements
                .into_iter()
                .map(|t| StackFrame {
                    function: t.function.unwrap_or_else(|| "?".to_string()),
                    line: t.line_number.unwrap_or(0),
                })
                .collect(),
        }
    }
}

/// `scripts.run` backed implementation of [`ScriptRunner`].
pub struct AppsScriptClient {
    http: Client,
    auth: Arc<GoogleAuthClient>,
    script_id: String,
}

impl AppsScriptClient {
    pub fn new(auth: Arc<GoogleAuthClient>, script_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            auth,
            script_id: script_id.into(),
        }
    }

    fn run_url(&self) -> String {
        format!(
            "https://script.googleapis.com/v1/scripts/{}:run",
            self.script_id
        )
    }
}

#[async_trait]
impl ScriptRunner for AppsScriptClient {
    async fn run_function(&self, function: &str) -> Result<ExecutionRecord, RetrievalError> {
        let token = self.auth.access_token().await.map_err(|err| match err {
            AuthError::NotAuthorized(reason) => RetrievalError::Unauthorized(reason),
            other => RetrievalError::Execution(other.to_string()),
        })?;

        let started_at = Utc::now();
        tracing::info!("running '{function}' on script {}", self.script_id);

        let response = self
            .http
            .post(self.run_url())
            .bearer_auth(&token)
            .json(&RunRequest {
                function,
                dev_mode: true,
            })
            .send()
            .await
            .map_err(|e| RetrievalError::Execution(e.to_string()))?;

        let ended_at = Utc::now();
        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unauthorized(format!(
                "scripts.run rejected the request ({status}): {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Keep the observed time window so the caller can still look
            // for whatever logs the failed run produced.
            tracing::error!("scripts.run failed ({status}): {body}");
            return Ok(ExecutionRecord {
                function: function.to_string(),
                started_at,
                ended_at,
                success: false,
                result: None,
                error: Some(ScriptError {
                    message: format!("scripts.run failed ({status}): {body}"),
                    error_type: "API_ERROR".to_string(),
                    stack: Vec::new(),
                }),
            });
        }

        let operation: RunOperation = response
            .json()
            .await
            .map_err(|e| RetrievalError::Execution(format!("invalid scripts.run response: {e}")))?;

        let error = operation.error.map(OperationError::into_script_error);
        if let Some(err) = &error {
            tracing::error!(
                "script error ({}): {}",
                err.error_type,
                err.message
            );
            for frame in &err.stack {
                tracing::error!("  at {}:{}", frame.function, frame.line);
            }
        }

        Ok(ExecutionRecord {
            function: function.to_string(),
            started_at,
            ended_at,
            success: error.is_none(),
            result: operation.response.and_then(|r| r.result),
            error,
        })
    }
}
