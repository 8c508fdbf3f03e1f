//! Batch types: outcome classification, per-batch counters, and the report payload.
//!
//! A batch is every file submitted in one upload. Each of its jobs ends in
//! exactly one [`Classification`]; the batch is complete when the number of
//! classified jobs reaches the count fixed at enqueue time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::job::{BatchId, JobData};

/// Terminal result of processing one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    /// The backend already holds this submission for the target. Not an error.
    AlreadyProcessed,
    Failed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::AlreadyProcessed => "already_processed",
            Classification::Failed => "failed",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Classification::Success),
            "already_processed" => Ok(Classification::AlreadyProcessed),
            "failed" => Ok(Classification::Failed),
            other => Err(format!("Unknown classification '{}'", other)),
        }
    }
}

/// One terminal job outcome, sent from the worker to the batch aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub batch_id: BatchId,
    pub file_name: String,
    pub classification: Classification,
    pub total_in_batch: u32,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
}

impl OutcomeEvent {
    pub fn from_job(data: &JobData, classification: Classification) -> Self {
        Self {
            batch_id: data.batch_id.clone(),
            file_name: data.original_name.clone(),
            classification,
            total_in_batch: data.total_in_batch,
            auth_token: data.auth_token.clone(),
            user_id: data.user_id.clone(),
        }
    }
}

/// Aggregate counters for one batch.
///
/// Invariant: `success_count + failed_count + already_processed_count <= total_files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub total_files: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub already_processed_count: u32,
    pub failed_files: Vec<String>,
    pub already_processed_files: Vec<String>,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
}

impl BatchState {
    /// Empty counters for the batch the event belongs to.
    pub fn new(event: &OutcomeEvent) -> Self {
        Self {
            batch_id: event.batch_id.clone(),
            total_files: event.total_in_batch,
            success_count: 0,
            failed_count: 0,
            already_processed_count: 0,
            failed_files: Vec::new(),
            already_processed_files: Vec::new(),
            auth_token: event.auth_token.clone(),
            user_id: event.user_id.clone(),
        }
    }

    pub fn completed_count(&self) -> u32 {
        self.success_count + self.failed_count + self.already_processed_count
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_files
    }

    /// Count one outcome. Returns false, leaving the counters untouched, if the
    /// batch has already accounted for all of its files.
    pub fn record(&mut self, classification: Classification, file_name: &str) -> bool {
        if self.completed_count() >= self.total_files {
            return false;
        }
        match classification {
            Classification::Success => self.success_count += 1,
            Classification::AlreadyProcessed => {
                self.already_processed_count += 1;
                self.already_processed_files.push(file_name.to_string());
            }
            Classification::Failed => {
                self.failed_count += 1;
                self.failed_files.push(file_name.to_string());
            }
        }
        true
    }
}

/// Body of the bulk-upload report sent to the application backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total_uploaded: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub already_applied_count: u32,
    pub failed_files: Vec<String>,
    pub already_applied_files: Vec<String>,
}

impl From<&BatchState> for BatchReport {
    fn from(batch: &BatchState) -> Self {
        Self {
            total_uploaded: batch.total_files,
            success_count: batch.success_count,
            failed_count: batch.failed_count,
            already_applied_count: batch.already_processed_count,
            failed_files: batch.failed_files.clone(),
            already_applied_files: batch.already_processed_files.clone(),
        }
    }
}
