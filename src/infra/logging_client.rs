// =============================================================================
// CLOUD LOGGING CLIENT
// =============================================================================
//
// Implements the core `LogSource` trait against the Cloud Logging v2
// `entries:list` endpoint. Apps Script executions land under
// `resource.type="app_script_function"`; executions triggered through the
// API additionally carry `invocation_type="apps script api"`, which is what
// lets us ignore manual runs from the script editor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::retrieval::{InvocationFilter, LogEntry, LogSource, RetrievalError, TimeWindow};
use crate::infra::google_auth::{AuthError, GoogleAuthClient};

const ENTRIES_LIST_URL: &str = "https://logging.googleapis.com/v2/entries:list";

/// Build the `entries:list` filter expression for a window. Timestamps go
/// out as RFC 3339; both bounds are inclusive.
pub fn build_filter(window: TimeWindow, filter: InvocationFilter) -> String {
    let mut clauses = vec![
        format!(
            "timestamp >= \"{}\"",
            window.start.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        ),
        format!(
            "timestamp <= \"{}\"",
            window.end.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        ),
        "resource.type=\"app_script_function\"".to_string(),
    ];
    if filter == InvocationFilter::ApiOnly {
        clauses.push("resource.labels.invocation_type=\"apps script api\"".to_string());
    }
    clauses.join(" AND ")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntriesListRequest {
    resource_names: Vec<String>,
    filter: String,
    order_by: String,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntriesListResponse {
    #[serde(default)]
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    json_payload: Option<serde_json::Value>,
    #[serde(default)]
    text_payload: Option<String>,
    #[serde(default)]
    resource: Option<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    #[serde(default)]
    labels: Option<RawLabels>,
}

#[derive(Debug, Deserialize)]
struct RawLabels {
    #[serde(default)]
    invocation_type: Option<String>,
}

impl RawEntry {
    fn into_log_entry(self) -> LogEntry {
        // Apps Script logs put the text either in jsonPayload.message or in
        // textPayload depending on how the script logged it.
        let message = self
            .json_payload
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(|m| m.as_str())
            .map(String::from)
            .or(self.text_payload);

        LogEntry {
            timestamp: self.timestamp,
            severity: self.severity.unwrap_or_else(|| "INFO".to_string()),
            message,
            invocation_type: self
                .resource
                .and_then(|r| r.labels)
                .and_then(|l| l.invocation_type),
        }
    }
}

/// Cloud Logging `entries:list` backed implementation of [`LogSource`].
pub struct CloudLoggingClient {
    http: Client,
    auth: Arc<GoogleAuthClient>,
    gcp_project_id: String,
}

impl CloudLoggingClient {
    pub fn new(auth: Arc<GoogleAuthClient>, gcp_project_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            auth,
            gcp_project_id: gcp_project_id.into(),
        }
    }
}

#[async_trait]
impl LogSource for CloudLoggingClient {
    async fn list_entries(
        &self,
        window: TimeWindow,
        filter: InvocationFilter,
        page_size: usize,
    ) -> Result<Vec<LogEntry>, RetrievalError> {
        let token = self.auth.access_token().await.map_err(|err| match err {
            AuthError::NotAuthorized(reason) => RetrievalError::Unauthorized(reason),
            other => RetrievalError::Logging(other.to_string()),
        })?;

        let request = EntriesListRequest {
            resource_names: vec![format!("projects/{}", self.gcp_project_id)],
            filter: build_filter(window, filter),
            order_by: "timestamp desc".to_string(),
            page_size,
        };

        tracing::debug!("querying Cloud Logging: {}", request.filter);

        let response = self
            .http
            .post(ENTRIES_LIST_URL)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| RetrievalError::Logging(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unauthorized(format!(
                "Cloud Logging rejected the request ({status}): {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Logging(format!(
                "entries:list failed ({status}): {body}"
            )));
        }

        let parsed: EntriesListResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Logging(format!("invalid entries response: {e}")))?;

        Ok(parsed
            .entries
            .into_iter()
            .map(RawEntry::into_log_entry)
            .collect())
    }
}
