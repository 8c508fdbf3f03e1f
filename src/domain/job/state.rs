//! Core job types.
//!
//! A job is one uploaded file within one batch. The payload (`JobData`) is fixed
//! at enqueue time; the queue record around it moves through the states below,
//! enforced at compile time with the typestate pattern.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::batch::Classification;

/// Identifier grouping the jobs of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a fresh identifier of the form `batch_<unix-millis>_<suffix>`.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        BatchId(format!(
            "batch_{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        BatchId(s.to_string())
    }
}

/// Unique identifier for a job record in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        JobId(uuid)
    }
}

impl std::ops::Deref for JobId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Unique identifier for a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for WorkerId {
    fn from(uuid: Uuid) -> Self {
        WorkerId(uuid)
    }
}

/// Where a job's file lives.
///
/// On the wire this is a single string: a local path, or `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FileRef {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl FileRef {
    /// Parse a file reference from its wire form.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s.strip_prefix("s3://") {
            Some(rest) => match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                    Ok(FileRef::Remote {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    })
                }
                _ => Err(format!(
                    "Invalid object reference: expected 's3://bucket/key', got '{}'",
                    s
                )),
            },
            None if s.is_empty() => Err("Empty file reference".to_string()),
            None => Ok(FileRef::Local(PathBuf::from(s))),
        }
    }

    pub fn remote(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        FileRef::Remote {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn local(path: impl AsRef<Path>) -> Self {
        FileRef::Local(path.as_ref().to_path_buf())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FileRef::Remote { .. })
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileRef::Local(path) => write!(f, "{}", path.display()),
            FileRef::Remote { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

impl TryFrom<String> for FileRef {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        FileRef::parse(&s)
    }
}

impl From<FileRef> for String {
    fn from(r: FileRef) -> Self {
        r.to_string()
    }
}

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed { delay: u64 },
    /// `delay * 2^(attempts_made - 1)`
    Exponential { delay: u64 },
}

/// Retry policy carried by every job, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay: 2000 },
        }
    }
}

impl RetryPolicy {
    /// Delay in milliseconds before the next attempt, given how many attempts
    /// have already been made (1-based).
    pub fn backoff_ms(&self, attempts_made: u32) -> u64 {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1);
                delay.saturating_mul(2u64.saturating_pow(exponent))
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

/// Payload of a job, as produced at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    #[serde(rename = "batchId")]
    pub batch_id: BatchId,

    /// Destination application record on the backend
    #[serde(rename = "jobId")]
    pub target_id: String,

    #[serde(rename = "originalName")]
    pub original_name: String,

    #[serde(rename = "filePath")]
    pub file_ref: FileRef,

    /// Number of files in the batch, fixed at enqueue time
    #[serde(rename = "totalFilesInBatch")]
    pub total_in_batch: u32,

    /// Optional location hint forwarded to the parser and merged into its output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Backend session token, sent as the raw `Authorization` header
    #[serde(rename = "sessionToken", default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Marker trait for valid job record states.
pub trait JobState: Send + Sync {}

/// A job record in the queue.
///
/// The generic parameter `T` represents the current state of the record.
#[derive(Debug, Clone, Serialize)]
pub struct Job<T: JobState> {
    pub id: JobId,
    pub retry: RetryPolicy,
    pub state: T,
    pub data: JobData,
}

// ============================================================================
// Job States
// ============================================================================

/// Waiting to be claimed, possibly gated by a backoff deadline.
#[derive(Debug, Clone, Serialize)]
pub struct Waiting {
    /// Number of attempts already made (0 = never attempted)
    pub attempts_made: u32,
    /// Earliest time this job can be claimed; None means immediately
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    /// Error from the previous attempt, if any
    pub last_error: Option<String>,
}

impl JobState for Waiting {}

/// Claimed by a worker and running through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Active {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    /// Attempts made before this one
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobState for Active {}

/// Reached a non-error terminal classification.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub classification: Classification,
    pub attempts_made: u32,
    pub completed_at: DateTime<Utc>,
}

impl JobState for Completed {}

/// Exhausted its attempts.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub reason: String,
    pub attempts_made: u32,
    pub failed_at: DateTime<Utc>,
}

impl JobState for Failed {}

/// Queue-level state used for filtering and cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStateFilter {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStateFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStateFilter::Waiting => "waiting",
            JobStateFilter::Active => "active",
            JobStateFilter::Completed => "completed",
            JobStateFilter::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enum that can hold a job record in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "job")]
pub enum AnyJob {
    Waiting(Job<Waiting>),
    Active(Job<Active>),
    Completed(Job<Completed>),
    Failed(Job<Failed>),
}

impl AnyJob {
    pub fn id(&self) -> JobId {
        match self {
            AnyJob::Waiting(j) => j.id,
            AnyJob::Active(j) => j.id,
            AnyJob::Completed(j) => j.id,
            AnyJob::Failed(j) => j.id,
        }
    }

    pub fn data(&self) -> &JobData {
        match self {
            AnyJob::Waiting(j) => &j.data,
            AnyJob::Active(j) => &j.data,
            AnyJob::Completed(j) => &j.data,
            AnyJob::Failed(j) => &j.data,
        }
    }

    pub fn state(&self) -> JobStateFilter {
        match self {
            AnyJob::Waiting(_) => JobStateFilter::Waiting,
            AnyJob::Active(_) => JobStateFilter::Active,
            AnyJob::Completed(_) => JobStateFilter::Completed,
            AnyJob::Failed(_) => JobStateFilter::Failed,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        match self {
            AnyJob::Waiting(j) => j.state.attempts_made,
            AnyJob::Active(j) => j.state.attempts_made,
            AnyJob::Completed(j) => j.state.attempts_made,
            AnyJob::Failed(j) => j.state.attempts_made,
        }
    }

    /// Check if this job is in a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyJob::Completed(_) | AnyJob::Failed(_))
    }

    /// When the record entered its terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyJob::Completed(j) => Some(j.state.completed_at),
            AnyJob::Failed(j) => Some(j.state.failed_at),
            _ => None,
        }
    }
}

impl From<Job<Waiting>> for AnyJob {
    fn from(j: Job<Waiting>) -> Self {
        AnyJob::Waiting(j)
    }
}

impl From<Job<Active>> for AnyJob {
    fn from(j: Job<Active>) -> Self {
        AnyJob::Active(j)
    }
}

impl From<Job<Completed>> for AnyJob {
    fn from(j: Job<Completed>) -> Self {
        AnyJob::Completed(j)
    }
}

impl From<Job<Failed>> for AnyJob {
    fn from(j: Job<Failed>) -> Self {
        AnyJob::Failed(j)
    }
}
