//! HTTP ingestion endpoint in front of the job producer.

pub mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{Method, header},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::error::{CourierError, Result};
use crate::producer::JobProducer;
use crate::queue::JobQueue;
use routes::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where uploaded files are staged before they are queued
    pub upload_dir: PathBuf,
    /// Per-file limit in bytes
    pub max_file_size: usize,
    /// Limit for a whole upload request in bytes
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            upload_dir: PathBuf::from("uploads"),
            max_file_size: 50 * 1024 * 1024,
            max_request_size: 1024 * 1024 * 1024,
        }
    }
}

/// Upload server.
pub struct IntakeServer<Q: JobQueue> {
    config: ServerConfig,
    state: AppState<Q>,
}

impl<Q: JobQueue + 'static> IntakeServer<Q> {
    pub fn new(config: ServerConfig, producer: Arc<JobProducer<Q>>) -> Self {
        let state = AppState {
            producer,
            upload_dir: config.upload_dir.clone(),
            max_file_size: config.max_file_size,
        };
        Self { config, state }
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

        Router::new()
            .route("/health", get(routes::health))
            .route(
                "/api/upload",
                post(routes::upload::<Q>)
                    .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                    .layer(RequestBodyLimitLayer::new(self.config.max_request_size)),
            )
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| CourierError::Validation(format!("Invalid address: {}", e)))?;

        tokio::fs::create_dir_all(&self.config.upload_dir).await?;
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Upload server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Upload server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AnyJob;
    use crate::producer::ProducerConfig;
    use crate::queue::InMemoryJobQueue;
    use crate::storage::StorageResolver;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const BOUNDARY: &str = "courier-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a [u8]),
    }

    fn multipart(parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", name, value)
                            .as_bytes(),
                    );
                }
                Part::File(file_name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\n\
                             Content-Type: application/pdf\r\n\r\n",
                            file_name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn server(dir: &std::path::Path, max_file_size: usize) -> (IntakeServer<InMemoryJobQueue>, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let producer = Arc::new(JobProducer::new(
            queue.clone(),
            StorageResolver::local(dir),
            ProducerConfig::default(),
        ));
        let config = ServerConfig {
            upload_dir: dir.to_path_buf(),
            max_file_size,
            ..Default::default()
        };
        (IntakeServer::new(config, producer), queue)
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path(), 1024);
        let response = server
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_upload_queues_files() {
        let dir = tempfile::tempdir().unwrap();
        let (server, queue) = server(dir.path(), 1024);

        let response = server
            .router()
            .oneshot(multipart(&[
                Part::Text("jobId", "job-5"),
                Part::Text("sessionToken", "session"),
                Part::Text("location", ""),
                Part::File("ada.pdf", b"%PDF-ada"),
                Part::File("grace.pdf", b"%PDF-grace"),
            ]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "2 files accepted");
        assert!(body["batchId"].as_str().unwrap().starts_with("batch_"));

        let jobs = queue.snapshot();
        assert_eq!(jobs.len(), 2);
        let AnyJob::Waiting(first) = &jobs[0] else {
            panic!("Expected waiting job");
        };
        assert_eq!(first.data.original_name, "ada.pdf");
        assert_eq!(first.data.target_id, "job-5");
        assert_eq!(first.data.auth_token.as_deref(), Some("session"));
        assert!(first.data.location.is_none());
        let crate::job::FileRef::Local(path) = &first.data.file_ref else {
            panic!("Expected local file");
        };
        assert!(path.to_string_lossy().ends_with("__ada.pdf"));
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-ada");
    }

    #[tokio::test]
    async fn test_repeated_file_names_are_staged_separately() {
        let dir = tempfile::tempdir().unwrap();
        let (server, queue) = server(dir.path(), 1024);

        let response = server
            .router()
            .oneshot(multipart(&[
                Part::Text("jobId", "job-5"),
                Part::File("cv.pdf", b"%PDF-first"),
                Part::File("cv.pdf", b"%PDF-second"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let paths: Vec<_> = queue
            .snapshot()
            .iter()
            .map(|job| match &job.data().file_ref {
                crate::job::FileRef::Local(path) => path.clone(),
                other => panic!("Expected local file, got {:?}", other),
            })
            .collect();
        assert_eq!(paths.len(), 2);
        assert_ne!(paths[0], paths[1]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"%PDF-first");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"%PDF-second");
        assert!(queue.snapshot().iter().all(|job| job.data().original_name == "cv.pdf"));
    }

    #[tokio::test]
    async fn test_upload_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (server, queue) = server(dir.path(), 1024);

        let no_files = server
            .router()
            .oneshot(multipart(&[Part::Text("jobId", "job-5")]))
            .await
            .unwrap();
        assert_eq!(no_files.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(no_files).await["error"], "No files uploaded");

        let no_job = server
            .router()
            .oneshot(multipart(&[Part::File("ada.pdf", b"%PDF")]))
            .await
            .unwrap();
        assert_eq!(no_job.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json(no_job).await["error"],
            "jobId is required in the request body"
        );

        assert!(queue.snapshot().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, queue) = server(dir.path(), 4);

        let response = server
            .router()
            .oneshot(multipart(&[
                Part::Text("jobId", "job-5"),
                Part::File("big.pdf", b"0123456789"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(queue.snapshot().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
