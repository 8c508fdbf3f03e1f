//! Error types for the intake and processing pipeline.

use thiserror::Error;

use crate::job::JobId;

/// Result type alias using the courier error type.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Main error type for the intake and processing pipeline.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Validation error (e.g., empty upload batch, missing target identifier)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The job's file could not be made available on local disk
    #[error("Failed to resolve file '{reference}': {reason}")]
    Resolution { reference: String, reason: String },

    /// A downstream service did not answer within its deadline
    #[error("Upstream request to {service} timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: &'static str, timeout_ms: u64 },

    /// A downstream service answered with something other than success
    #[error("Upstream {service} returned status {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The batch report could not be delivered
    #[error("Failed to deliver report for batch {batch_id}: {reason}")]
    ReportDelivery { batch_id: String, reason: String },

    /// Enqueueing a batch stopped part-way; `enqueued` jobs are already in the queue
    #[error("Enqueue failed after {enqueued} job(s) were queued: {source}")]
    Enqueue {
        enqueued: usize,
        #[source]
        source: Box<CourierError>,
    },

    /// Queue transport failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Job not found in the queue
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Worker is shutting down
    #[error("Worker is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object storage error
    #[error("Object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CourierError {
    /// Returns true if a job attempt that failed with this error should be
    /// handed back to the transport for another attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            CourierError::Resolution { .. }
            | CourierError::UpstreamTimeout { .. }
            | CourierError::Upstream { .. }
            | CourierError::HttpClient(_)
            | CourierError::Io(_)
            | CourierError::ObjectStore(_)
            | CourierError::Serialization(_)
            | CourierError::Other(_) => true,
            CourierError::Validation(_)
            | CourierError::ReportDelivery { .. }
            | CourierError::Enqueue { .. }
            | CourierError::Queue(_)
            | CourierError::JobNotFound(_)
            | CourierError::Shutdown => false,
        }
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CourierError::Validation(_) => "validation",
            CourierError::Resolution { .. } => "resolution",
            CourierError::UpstreamTimeout { .. } => "upstream_timeout",
            CourierError::Upstream { .. } => "upstream",
            CourierError::ReportDelivery { .. } => "report_delivery",
            CourierError::Enqueue { .. } => "enqueue",
            CourierError::Queue(_) => "queue",
            CourierError::JobNotFound(_) => "job_not_found",
            CourierError::Shutdown => "shutdown",
            CourierError::HttpClient(_) => "http",
            CourierError::Serialization(_) => "serialization",
            CourierError::Io(_) => "io",
            CourierError::ObjectStore(_) => "object_store",
            CourierError::Other(_) => "other",
        }
    }
}
