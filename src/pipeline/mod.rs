//! Per-job processing: resolve, parse, submit, classify, clean up, pace.
//!
//! The executor runs one attempt and returns its classification. Errors are
//! returned to the caller (the worker daemon) which decides, through the job
//! queue, whether the job is retried or has failed for good.

pub mod state;
pub mod transitions;

use std::time::Duration;

pub use state::{Aborted, Attempt, AttemptState};

use crate::batch::Classification;
use crate::error::Result;
use crate::http::HttpClient;
use crate::job::JobData;
use crate::storage::StorageResolver;
use crate::upstream::UpstreamClient;

/// Runs pipeline attempts.
#[derive(Clone)]
pub struct PipelineExecutor<H: HttpClient> {
    resolver: StorageResolver,
    upstream: UpstreamClient<H>,
    pacing: Duration,
}

impl<H: HttpClient> PipelineExecutor<H> {
    pub fn new(resolver: StorageResolver, upstream: UpstreamClient<H>, pacing: Duration) -> Self {
        Self {
            resolver,
            upstream,
            pacing,
        }
    }

    pub fn resolver(&self) -> &StorageResolver {
        &self.resolver
    }

    /// Run one attempt for `data`.
    ///
    /// On success the resolved file is deleted and the worker sleeps for the
    /// pacing delay before returning. On error only a fetched temp copy is
    /// deleted; a local source file stays for the next attempt.
    #[tracing::instrument(skip(self, data), fields(batch_id = %data.batch_id, file = %data.original_name))]
    pub async fn execute(&self, data: JobData) -> Result<Classification> {
        let parsing = Attempt::new(data).resolve(&self.resolver).await?;

        let classified = match parsing.parse(&self.upstream).await {
            Ok(submitting) => submitting.submit(&self.upstream).await,
            Err(aborted) => Err(aborted),
        };

        match classified {
            Ok(classified) => {
                let done = classified.clean_up().await.pace(self.pacing).await;
                Ok(done.classification())
            }
            Err(Aborted { error, file }) => {
                self.resolver.discard_fetched(&file).await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CourierError;
    use crate::http::MockHttpClient;
    use crate::job::{BatchId, FileRef};
    use crate::upstream::UpstreamConfig;
    use object_store::memory::InMemory;
    use object_store::{ObjectStore, PutPayload, path::Path as ObjectPath};
    use std::path::Path;
    use std::sync::Arc;

    const PARSE: &str = "POST /api/cv-to-json";
    const APPLY: &str = "POST /api/candidate/apply/job-1";

    fn executor(mock: &MockHttpClient, temp_dir: &Path, pacing: Duration) -> PipelineExecutor<MockHttpClient> {
        executor_with(mock, StorageResolver::local(temp_dir), pacing)
    }

    fn executor_with(
        mock: &MockHttpClient,
        resolver: StorageResolver,
        pacing: Duration,
    ) -> PipelineExecutor<MockHttpClient> {
        let upstream = UpstreamClient::new(
            mock.clone(),
            UpstreamConfig {
                parser_url: "http://parser.local/api/cv-to-json".to_string(),
                backend_url: "http://backend.local".to_string(),
                ..Default::default()
            },
        );
        PipelineExecutor::new(resolver, upstream, pacing)
    }

    fn job_data(file_ref: FileRef) -> JobData {
        JobData {
            batch_id: BatchId::from("batch_pipe"),
            target_id: "job-1".to_string(),
            original_name: "ada.pdf".to_string(),
            file_ref,
            total_in_batch: 1,
            location: Some("Berlin".to_string()),
            auth_token: Some("session".to_string()),
            user_id: None,
        }
    }

    fn write_upload(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("1700000000000__ada.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        path
    }

    #[test_log::test(tokio::test)]
    async fn test_success_deletes_local_file_and_paces() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_upload(dir.path());
        let mock = MockHttpClient::new();
        mock.respond(PARSE, 200, r#"{"name":"Ada"}"#);
        mock.respond(APPLY, 200, r#"{"status":true}"#);

        let pacing = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let classification = executor(&mock, dir.path(), pacing)
            .execute(job_data(FileRef::local(&upload)))
            .await
            .unwrap();

        assert_eq!(classification, Classification::Success);
        assert!(started.elapsed() >= pacing);
        assert!(!upload.exists());

        let apply = &mock.calls_to("/api/candidate/apply/job-1")[0];
        assert!(apply.files_present);
        let candidate: serde_json::Value =
            serde_json::from_str(apply.form_text("candidateData").unwrap()).unwrap();
        assert_eq!(candidate["name"], "Ada");
        assert_eq!(candidate["location"], "Berlin");
    }

    #[tokio::test]
    async fn test_forbidden_is_already_processed() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_upload(dir.path());
        let mock = MockHttpClient::new();
        mock.respond(PARSE, 200, r#"{"name":"Ada"}"#);
        mock.respond(APPLY, 403, r#"{"message":"already applied"}"#);

        let classification = executor(&mock, dir.path(), Duration::ZERO)
            .execute(job_data(FileRef::local(&upload)))
            .await
            .unwrap();

        assert_eq!(classification, Classification::AlreadyProcessed);
        assert!(!upload.exists());
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_local_source_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_upload(dir.path());
        let mock = MockHttpClient::new();
        mock.respond(PARSE, 500, "parser down");

        let err = executor(&mock, dir.path(), Duration::ZERO)
            .execute(job_data(FileRef::local(&upload)))
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        assert!(upload.exists());
        assert!(mock.calls_to("/api/candidate/apply/job-1").is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_fetch_deletes_temp_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemory::new());
        store
            .put(
                &ObjectPath::from("batch_pipe/ada.pdf"),
                PutPayload::from_static(b"%PDF"),
            )
            .await
            .unwrap();
        let resolver = StorageResolver::local(dir.path()).with_remote(store, "cv-bucket");

        let mock = MockHttpClient::new();
        mock.respond(PARSE, 200, r#"{"name":"Ada"}"#);
        mock.respond(APPLY, 500, "backend down");

        let err = executor_with(&mock, resolver, Duration::ZERO)
            .execute(job_data(FileRef::remote("cv-bucket", "batch_pipe/ada.pdf")))
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Upstream { status: 500, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockHttpClient::new();

        let err = executor(&mock, dir.path(), Duration::ZERO)
            .execute(job_data(FileRef::local(dir.path().join("gone.pdf"))))
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Resolution { .. }));
        assert_eq!(mock.call_count(), 0);
    }
}
