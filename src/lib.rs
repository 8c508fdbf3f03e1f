//! Batch document intake with a paced parse-and-apply worker.
//!
//! Uploads arrive as batches of CV files. The [`JobProducer`] queues one job
//! per file; the worker [`Daemon`] claims jobs one at a time, sends each file
//! to the parser and then to the application backend, and retries failures
//! with exponential backoff through the [`JobQueue`]. Every terminal outcome
//! is counted per batch, and a single report is sent to the backend when the
//! last file of a batch finishes.
//!
//! Queue records live in memory ([`InMemoryJobQueue`]) or in PostgreSQL
//! (`PostgresJobQueue`, `postgres` feature).

pub mod batch;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod http;
pub mod job;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod server;
pub mod storage;
pub mod upstream;

// Re-export commonly used types
pub use batch::{
    AggregatorHandle, BatchAggregator, BatchReport, BatchState, Classification, GlobalStats,
    OutcomeEvent, ReportDispatcher,
};
pub use daemon::{Daemon, DaemonConfig, JanitorConfig};
pub use error::{CourierError, Result};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use job::*;
pub use pipeline::PipelineExecutor;
pub use producer::{
    BatchSubmission, JobProducer, ProducerConfig, StorageMode, UploadBatch, UploadedFile,
};
pub use queue::{InMemoryJobQueue, JobCounts, JobQueue};
#[cfg(feature = "postgres")]
pub use queue::PostgresJobQueue;
pub use server::{IntakeServer, ServerConfig};
pub use storage::{ResolvedFile, StorageResolver};
pub use upstream::{UpstreamClient, UpstreamConfig};

/// Get the courier database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
