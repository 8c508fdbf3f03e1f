//! HTTP client abstraction for talking to the parser and the application backend.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request execution,
//! enabling testability with mock implementations.

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl HttpResponse {
    /// True for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    /// Plain text field
    Text { name: String, value: String },
    /// File field, read from disk when the request is sent
    File {
        name: String,
        file_name: String,
        path: PathBuf,
    },
}

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// JSON document, sent with `Content-Type: application/json`
    Json(String),
    /// multipart/form-data
    Multipart(Vec<FormPart>),
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (e.g., "POST")
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Raw value for the `Authorization` header, sent as-is when present
    pub authorization: Option<String>,
    pub body: RequestBody,
}

impl HttpRequest {
    /// Build a POST request with no body.
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            authorization: None,
            body: RequestBody::Empty,
        }
    }

    /// Attach a raw `Authorization` header value. Empty tokens are dropped.
    pub fn with_authorization(mut self, token: Option<&str>) -> Self {
        self.authorization = token.filter(|t| !t.is_empty()).map(str::to_string);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// The path portion of the URL, used for logging and mock lookup.
    pub fn path(&self) -> String {
        reqwest::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone())
    }
}

/// Trait for executing HTTP requests.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the pipeline testable without making real HTTP calls.
///
/// # Example
/// ```ignore
/// let client = ReqwestHttpClient::new();
/// let response = client.execute(&request, 30_000).await?;
/// println!("Status: {}, Body: {}", response.status, response.body);
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute an HTTP request.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The request fails due to network issues
    /// - The request times out
    /// - A multipart file part cannot be read from disk
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn build_form(parts: &[FormPart]) -> Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for part in parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                FormPart::File {
                    name,
                    file_name,
                    path,
                } => {
                    let bytes = tokio::fs::read(path).await?;
                    form.part(
                        name.clone(),
                        reqwest::multipart::Part::bytes(bytes).file_name(file_name.clone()),
                    )
                }
            };
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path()))]
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        tracing::debug!(url = %request.url, timeout_ms, "Executing HTTP request");

        let method = request.method.parse::<reqwest::Method>().map_err(|e| {
            tracing::error!(method = %request.method, error = %e, "Invalid HTTP method");
            anyhow::anyhow!("Invalid HTTP method '{}': {}", request.method, e)
        })?;

        let mut req = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(timeout_ms));

        if let Some(token) = &request.authorization {
            req = req.header(reqwest::header::AUTHORIZATION, token.as_str());
        }

        req = match &request.body {
            RequestBody::Empty => req,
            RequestBody::Json(body) => req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
            RequestBody::Multipart(parts) => req.multipart(Self::build_form(parts).await?),
        };

        let response = req.send().await.map_err(|e| {
            tracing::warn!(url = %request.url, error = %e, "HTTP request failed");
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "HTTP request completed");

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock HTTP client for testing.
///
/// Responses are keyed by `"{method} {path}"` and returned in FIFO order.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "POST /api/cv-to-json",
///     Ok(HttpResponse { status: 200, body: r#"{"name":"Ada"}"#.to_string() }),
/// );
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: RequestBody,
    pub timeout_ms: u64,
    /// Whether every file part existed on disk when the call was made
    pub files_present: bool,
}

impl MockCall {
    /// Value of a text part of a multipart body, if present.
    pub fn form_text(&self, field: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Multipart(parts) => parts.iter().find_map(|p| match p {
                FormPart::Text { name, value } if name == field => Some(value.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }

    /// File name of a file part of a multipart body, if present.
    pub fn form_file_name(&self, field: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Multipart(parts) => parts.iter().find_map(|p| match p {
                FormPart::File {
                    name, file_name, ..
                } if name == field => Some(file_name.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }

    /// JSON body, if this was a JSON request.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        match &self.body {
            RequestBody::Json(body) => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predetermined response for a specific method and path.
    ///
    /// Multiple responses can be added for the same key - they will be returned
    /// in FIFO order.
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Shorthand for a successful response with the given status and body.
    pub fn respond(&self, key: &str, status: u16, body: &str) {
        self.add_response(
            key,
            Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
        );
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Calls made to the given path.
    pub fn calls_to(&self, path: &str) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        let path = request.path();
        let files_present = match &request.body {
            RequestBody::Multipart(parts) => parts.iter().all(|p| match p {
                FormPart::File { path, .. } => path.exists(),
                FormPart::Text { .. } => true,
            }),
            _ => true,
        };

        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            path: path.clone(),
            authorization: request.authorization.clone(),
            body: request.body.clone(),
            timeout_ms,
            files_present,
        });

        let key = format!("{} {}", request.method, path);
        let response = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&key)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        response.unwrap_or_else(|| {
            Err(crate::error::CourierError::Other(anyhow::anyhow!(
                "No mock response configured for {}",
                key
            )))
        })
    }
}
