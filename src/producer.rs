//! Turning an upload into queued jobs.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};
use crate::job::{BatchId, FileRef, JobData, RetryPolicy};
use crate::queue::JobQueue;
use crate::storage::{StorageResolver, remove_quietly};

/// Where intake files are kept until a worker picks them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Files stay in the local upload directory
    #[default]
    Local,
    /// Files are uploaded to the object store bucket
    S3,
}

impl FromStr for StorageMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "s3" => Ok(StorageMode::S3),
            other => Err(format!("Unknown storage type '{}', expected 'local' or 's3'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub storage_mode: StorageMode,
    /// Retry policy attached to every job
    pub retry: RetryPolicy,
}

/// A file already written to local disk by the intake adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub original_name: String,
    pub path: PathBuf,
}

/// Everything submitted in one upload request.
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    pub files: Vec<UploadedFile>,
    pub target_id: Option<String>,
    pub user_id: Option<String>,
    pub location: Option<String>,
    pub auth_token: Option<String>,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    pub accepted: usize,
}

/// Validates uploads and enqueues one job per file.
pub struct JobProducer<Q: JobQueue> {
    queue: Arc<Q>,
    storage: StorageResolver,
    config: ProducerConfig,
}

impl<Q: JobQueue> JobProducer<Q> {
    pub fn new(queue: Arc<Q>, storage: StorageResolver, config: ProducerConfig) -> Self {
        Self {
            queue,
            storage,
            config,
        }
    }

    /// Validate the batch and enqueue it.
    ///
    /// Rejected batches have their staged files deleted. If storage upload or
    /// enqueueing fails part-way, the jobs already queued stay queued, the
    /// remaining staged files are deleted, and the error reports how many
    /// jobs were queued.
    #[tracing::instrument(skip(self, batch), fields(files = batch.files.len()))]
    pub async fn submit_batch(&self, batch: UploadBatch) -> Result<BatchSubmission> {
        if let Err(e) = Self::validate(&batch) {
            for file in &batch.files {
                remove_quietly(&file.path).await;
            }
            return Err(e);
        }

        let UploadBatch {
            files,
            target_id,
            user_id,
            location,
            auth_token,
        } = batch;
        let target_id = target_id.unwrap_or_default();
        let batch_id = BatchId::generate();
        let total = files.len();

        for (enqueued, file) in files.iter().enumerate() {
            let file_ref = match self.file_ref_for(&batch_id, enqueued, file).await {
                Ok(file_ref) => file_ref,
                Err(e) => {
                    return Err(Self::abandon(&batch_id, &files[enqueued..], enqueued, e).await);
                }
            };

            let data = JobData {
                batch_id: batch_id.clone(),
                target_id: target_id.clone(),
                original_name: file.original_name.clone(),
                file_ref,
                total_in_batch: total as u32,
                location: location.clone(),
                auth_token: auth_token.clone(),
                user_id: user_id.clone(),
            };

            if let Err(e) = self.queue.enqueue(data, self.config.retry).await {
                return Err(Self::abandon(&batch_id, &files[enqueued..], enqueued, e).await);
            }
        }

        counter!("courier_batches_submitted_total").increment(1);
        tracing::info!(batch_id = %batch_id, files = total, "Batch accepted");
        Ok(BatchSubmission {
            batch_id,
            accepted: total,
        })
    }

    fn validate(batch: &UploadBatch) -> Result<()> {
        if batch.files.is_empty() {
            return Err(CourierError::Validation("No files uploaded".to_string()));
        }
        if batch.target_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            return Err(CourierError::Validation(
                "jobId is required in the request body".to_string(),
            ));
        }
        Ok(())
    }

    async fn file_ref_for(
        &self,
        batch_id: &BatchId,
        position: usize,
        file: &UploadedFile,
    ) -> Result<FileRef> {
        match self.config.storage_mode {
            StorageMode::Local => Ok(FileRef::local(&file.path)),
            StorageMode::S3 => {
                let key = object_key(batch_id, position, &file.original_name);
                let file_ref = self.storage.upload(&file.path, &key).await?;
                remove_quietly(&file.path).await;
                Ok(file_ref)
            }
        }
    }

    /// Stop a batch part-way. Staged files with no queued job are deleted.
    async fn abandon(
        batch_id: &BatchId,
        unqueued: &[UploadedFile],
        enqueued: usize,
        source: CourierError,
    ) -> CourierError {
        tracing::error!(
            batch_id = %batch_id,
            enqueued,
            abandoned = unqueued.len(),
            error = %source,
            "Batch enqueue stopped part-way"
        );
        for file in unqueued {
            remove_quietly(&file.path).await;
        }
        CourierError::Enqueue {
            enqueued,
            source: Box::new(source),
        }
    }
}

/// Bucket key for one file of a batch. The position keeps repeated names apart.
fn object_key(batch_id: &BatchId, position: usize, original_name: &str) -> String {
    format!("{}/{}_{}", batch_id, position, original_name)
}
