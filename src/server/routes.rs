//! Upload and health handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, State, multipart::Field},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::CourierError;
use crate::producer::{JobProducer, UploadBatch, UploadedFile};
use crate::queue::JobQueue;
use crate::storage::remove_quietly;

/// Shared handler state.
pub struct AppState<Q: JobQueue> {
    pub producer: Arc<JobProducer<Q>>,
    /// Directory where incoming files are staged
    pub upload_dir: PathBuf,
    /// Per-file size limit in bytes
    pub max_file_size: usize,
}

impl<Q: JobQueue> Clone for AppState<Q> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            upload_dir: self.upload_dir.clone(),
            max_file_size: self.max_file_size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "batchId")]
    pub batch_id: String,
}

/// Error returned by the upload handler.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    Internal,
}

impl From<CourierError> for ApiError {
    fn from(e: CourierError) -> Self {
        match e {
            CourierError::Validation(msg) => ApiError::BadRequest(msg),
            other => {
                tracing::error!(error = %other, "Upload failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Upload failed".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// POST /api/upload - multipart with `files` plus `jobId`, `userId`,
/// `location`, `sessionToken` text fields.
pub async fn upload<Q: JobQueue + 'static>(
    State(state): State<AppState<Q>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut batch = UploadBatch::default();

    let staged = read_form(&state, &mut multipart, &mut batch).await;
    if let Err(e) = staged {
        for file in &batch.files {
            remove_quietly(&file.path).await;
        }
        return Err(e);
    }

    let accepted = batch.files.len();
    let submission = state.producer.submit_batch(batch).await?;

    Ok(Json(UploadResponse {
        success: true,
        message: format!("{} files accepted", accepted),
        batch_id: submission.batch_id.to_string(),
    }))
}

async fn read_form<Q: JobQueue>(
    state: &AppState<Q>,
    multipart: &mut Multipart,
    batch: &mut UploadBatch,
) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(|e| ApiError::from(CourierError::Io(e)))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "files" | "files[]" => {
                let file = stage_file(state, field).await?;
                tracing::debug!(file = %file.original_name, "Staged upload");
                batch.files.push(file);
            }
            "jobId" => batch.target_id = text(field).await?,
            "userId" => batch.user_id = text(field).await?,
            "location" => batch.location = text(field).await?,
            "sessionToken" => batch.auth_token = text(field).await?,
            other => tracing::debug!(field = %other, "Ignoring unknown form field"),
        }
    }
    Ok(())
}

async fn text(field: Field<'_>) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read form field: {}", e)))?;
    Ok(Some(value).filter(|v| !v.is_empty()))
}

async fn stage_file<Q: JobQueue>(
    state: &AppState<Q>,
    mut field: Field<'_>,
) -> Result<UploadedFile, ApiError> {
    let original_name = field
        .file_name()
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("File part is missing a file name".to_string()))?;

    let path = state.upload_dir.join(staged_file_name(&original_name));
    let mut out = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .map_err(|e| ApiError::from(CourierError::Io(e)))?;

    let mut written = 0usize;
    let result = async {
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?
        {
            written += chunk.len();
            if written > state.max_file_size {
                return Err(ApiError::PayloadTooLarge(format!(
                    "File '{}' exceeds the {} byte limit",
                    original_name, state.max_file_size
                )));
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| ApiError::from(CourierError::Io(e)))?;
        }
        out.flush()
            .await
            .map_err(|e| ApiError::from(CourierError::Io(e)))
    }
    .await;

    if let Err(e) = result {
        remove_quietly(&path).await;
        return Err(e);
    }

    Ok(UploadedFile {
        original_name,
        path,
    })
}

/// `{millis}_{uuid}__{name}`, unique even for repeated names in one request.
fn staged_file_name(original_name: &str) -> String {
    format!(
        "{}_{}__{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple(),
        original_name
    )
}
