//! The remote audit API seam.
//!
//! Stages consume the provider through [`AuditApi`] so tests can substitute
//! canned payloads; [`GoAuditsClient`] is the production implementation over
//! the retrying HTTP client.

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::SecretString;
use serde_json::{Value, json};

use crate::http::{ApiError, HttpClient};

/// Date window sent with summary requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
    /// Inclusive start date.
    pub start_date: NaiveDate,
    /// Inclusive end date.
    pub end_date: NaiveDate,
}

/// Remote audit API: summary listing plus per-report details.
#[async_trait]
pub trait AuditApi: Send + Sync {
    /// Fetches the completed-audit summary for a date window.
    async fn fetch_summary(&self, window: SummaryWindow) -> Result<Vec<Value>, ApiError>;

    /// Fetches the detail rows for one report.
    async fn fetch_details(&self, report_id: &str) -> Result<Vec<Value>, ApiError>;
}

/// Production client for the GoAudits endpoints.
pub struct GoAuditsClient {
    http: HttpClient,
    summary_url: String,
    details_url: String,
    bearer: SecretString,
    filter_id: i64,
}

impl GoAuditsClient {
    /// Creates a client for the configured endpoints.
    #[must_use]
    pub fn new(
        http: HttpClient,
        summary_url: impl Into<String>,
        details_url: impl Into<String>,
        bearer: SecretString,
        filter_id: i64,
    ) -> Self {
        Self {
            http,
            summary_url: summary_url.into(),
            details_url: details_url.into(),
            bearer,
            filter_id,
        }
    }

    /// The summary request body: the date window plus the filler fields the
    /// provider requires on every call.
    fn summary_body(&self, window: SummaryWindow) -> Value {
        json!({
            "start_date": window.start_date.format("%Y-%m-%d").to_string(),
            "end_date": window.end_date.format("%Y-%m-%d").to_string(),
            "status": "Completed",
            "jsonflag": true,
            "filterId": self.filter_id,
            "client_id": "",
            "user_id": "",
            "location_id": 0,
            "checklist_id": 0,
            "archived": false,
        })
    }

    /// The details request body: `audit_id` merged into the provider's
    /// fixed base object. The base keys are required verbatim or the
    /// endpoint answers with a summary-level response instead of detail
    /// rows.
    fn details_body(&self, report_id: &str) -> Value {
        let mut body = details_base_request();
        if let Some(map) = body.as_object_mut() {
            map.insert("audit_id".to_string(), Value::String(report_id.to_string()));
        }
        body
    }
}

/// The externally defined base object for details requests.
fn details_base_request() -> Value {
    json!({
        "jsonflag": true,
        "record_type": "All",
        "status": "Completed",
        "client_id": "",
        "user_id": "",
        "checklist_id": 0,
        "location_id": 0,
        "start_date": "",
        "end_date": "",
    })
}

#[async_trait]
impl AuditApi for GoAuditsClient {
    async fn fetch_summary(&self, window: SummaryWindow) -> Result<Vec<Value>, ApiError> {
        self.http
            .post_json_array(&self.summary_url, &self.summary_body(window), &self.bearer)
            .await
    }

    async fn fetch_details(&self, report_id: &str) -> Result<Vec<Value>, ApiError> {
        self.http
            .post_json_array(&self.details_url, &self.details_body(report_id), &self.bearer)
            .await
    }
}

impl std::fmt::Debug for GoAuditsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoAuditsClient")
            .field("summary_url", &self.summary_url)
            .field("details_url", &self.details_url)
            .field("filter_id", &self.filter_id)
            .finish_non_exhaustive()
    }
}
