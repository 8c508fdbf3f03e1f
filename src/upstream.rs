//! Clients for the two downstream services: the CV parser and the application
//! backend (candidate apply + bulk upload report).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::batch::{BatchReport, Classification};
use crate::error::{CourierError, Result};
use crate::http::{FormPart, HttpClient, HttpRequest, RequestBody};

const PARSER: &str = "parser";
const BACKEND: &str = "backend";

/// Endpoints and deadlines for downstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL of the CV-to-JSON endpoint
    pub parser_url: String,
    /// Base URL of the application backend
    pub backend_url: String,
    pub parse_timeout_ms: u64,
    pub apply_timeout_ms: u64,
    pub report_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            parser_url: "http://localhost:8001/api/cv-to-json".to_string(),
            backend_url: "http://localhost:5000".to_string(),
            parse_timeout_ms: 120_000,
            apply_timeout_ms: 30_000,
            report_timeout_ms: 30_000,
        }
    }
}

impl UpstreamConfig {
    fn backend(&self, path: &str) -> String {
        format!("{}{}", self.backend_url.trim_end_matches('/'), path)
    }

    pub fn apply_url(&self, target_id: &str) -> String {
        self.backend(&format!("/api/candidate/apply/{}", target_id))
    }

    pub fn report_url(&self) -> String {
        self.backend("/api/report/send-bulk-upload-report")
    }
}

/// Turn a transport-level timeout into `UpstreamTimeout`; other errors pass through.
fn classify_transport(service: &'static str, timeout_ms: u64) -> impl Fn(CourierError) -> CourierError {
    move |e| match e {
        CourierError::HttpClient(inner) if inner.is_timeout() => {
            CourierError::UpstreamTimeout { service, timeout_ms }
        }
        other => other,
    }
}

/// JavaScript-style truthiness, which is what the backend's `status` flag uses.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Talks to the parser and the backend on behalf of the pipeline.
#[derive(Clone)]
pub struct UpstreamClient<H: HttpClient> {
    http: H,
    config: UpstreamConfig,
}

impl<H: HttpClient> UpstreamClient<H> {
    pub fn new(http: H, config: UpstreamConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Send the file to the parser and return its structured output with
    /// `location` merged in (set when given, removed otherwise).
    #[tracing::instrument(skip(self, file, location), fields(file = %original_name))]
    pub async fn parse(
        &self,
        file: &Path,
        original_name: &str,
        location: Option<&str>,
    ) -> Result<Map<String, Value>> {
        let mut parts = vec![FormPart::File {
            name: "file".to_string(),
            file_name: original_name.to_string(),
            path: file.to_path_buf(),
        }];
        if let Some(location) = location {
            parts.push(FormPart::Text {
                name: "location".to_string(),
                value: location.to_string(),
            });
        }

        let timeout_ms = self.config.parse_timeout_ms;
        let request = HttpRequest::post(self.config.parser_url.trim_end_matches('/'))
            .with_body(RequestBody::Multipart(parts));
        let response = self
            .http
            .execute(&request, timeout_ms)
            .await
            .map_err(classify_transport(PARSER, timeout_ms))?;

        if !response.is_success() {
            return Err(CourierError::Upstream {
                service: PARSER,
                status: response.status,
                body: response.body,
            });
        }

        let mut candidate = match serde_json::from_str::<Value>(&response.body) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(CourierError::Upstream {
                    service: PARSER,
                    status: response.status,
                    body: format!("expected a JSON object, got: {}", response.body),
                });
            }
        };

        match location {
            Some(location) => {
                candidate.insert("location".to_string(), Value::String(location.to_string()));
            }
            None => {
                candidate.remove("location");
            }
        }

        tracing::debug!(fields = candidate.len(), "Parsed CV");
        Ok(candidate)
    }

    /// Submit the file and its parsed data to the backend.
    ///
    /// 403 means the backend already holds this submission and is reported
    /// as [`Classification::AlreadyProcessed`], never as an error.
    #[tracing::instrument(skip(self, file, candidate, auth_token), fields(file = %original_name))]
    pub async fn apply(
        &self,
        target_id: &str,
        file: &Path,
        original_name: &str,
        candidate: &Map<String, Value>,
        auth_token: Option<&str>,
    ) -> Result<Classification> {
        let parts = vec![
            FormPart::File {
                name: "file".to_string(),
                file_name: original_name.to_string(),
                path: file.to_path_buf(),
            },
            FormPart::Text {
                name: "candidateData".to_string(),
                value: serde_json::to_string(candidate)?,
            },
        ];

        let timeout_ms = self.config.apply_timeout_ms;
        let request = HttpRequest::post(self.config.apply_url(target_id))
            .with_authorization(auth_token)
            .with_body(RequestBody::Multipart(parts));
        let response = self
            .http
            .execute(&request, timeout_ms)
            .await
            .map_err(classify_transport(BACKEND, timeout_ms))?;

        if response.status == 403 {
            return Ok(Classification::AlreadyProcessed);
        }

        let accepted = response.is_success()
            && serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|body| body.get("status").map(is_truthy))
                .unwrap_or(false);

        if accepted {
            Ok(Classification::Success)
        } else {
            Err(CourierError::Upstream {
                service: BACKEND,
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Deliver a batch report.
    #[tracing::instrument(skip(self, report, auth_token), fields(batch_id = %batch_id))]
    pub async fn send_report(
        &self,
        batch_id: &str,
        report: &BatchReport,
        auth_token: Option<&str>,
    ) -> Result<()> {
        let delivery = |reason: String| CourierError::ReportDelivery {
            batch_id: batch_id.to_string(),
            reason,
        };

        let request = HttpRequest::post(self.config.report_url())
            .with_authorization(auth_token)
            .with_body(RequestBody::Json(serde_json::to_string(report)?));
        let response = self
            .http
            .execute(&request, self.config.report_timeout_ms)
            .await
            .map_err(|e| delivery(e.to_string()))?;

        if !response.is_success() {
            return Err(delivery(format!(
                "status {}: {}",
                response.status, response.body
            )));
        }
        Ok(())
    }
}
