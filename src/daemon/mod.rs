//! Worker daemon that drains the job queue.
//!
//! One worker claims one job at a time, runs it through the pipeline, applies
//! the job's retry policy through the queue, and forwards every terminal
//! outcome to the batch aggregator task. A janitor task prunes old records.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::batch::{
    AggregatorHandle, BatchAggregator, Classification, GlobalStats, OutcomeEvent,
    ReportDispatcher,
};
use crate::error::Result;
use crate::http::HttpClient;
use crate::job::{Active, FailureDisposition, FileRef, Job, WorkerId};
use crate::pipeline::PipelineExecutor;
use crate::queue::JobQueue;
use crate::storage::{StorageResolver, remove_quietly};
use crate::upstream::{UpstreamClient, UpstreamConfig};

pub mod janitor;

pub use janitor::JanitorConfig;

/// Configuration for the worker daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long to sleep when the queue has nothing claimable
    pub poll_interval_ms: u64,

    /// Pause after each successfully classified job
    pub worker_delay_ms: u64,

    pub upstream: UpstreamConfig,

    pub janitor: JanitorConfig,

    /// Interval for logging queue counts. None disables it.
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            worker_delay_ms: 10_000,
            upstream: UpstreamConfig::default(),
            janitor: JanitorConfig::default(),
            status_log_interval_ms: Some(60_000),
        }
    }
}

/// Daemon that processes queued upload jobs.
pub struct Daemon<Q, H>
where
    Q: JobQueue,
    H: HttpClient,
{
    worker_id: WorkerId,
    queue: Arc<Q>,
    pipeline: PipelineExecutor<H>,
    upstream: UpstreamClient<H>,
    config: DaemonConfig,
    shutdown_token: CancellationToken,
}

impl<Q, H> Daemon<Q, H>
where
    Q: JobQueue + 'static,
    H: HttpClient + 'static,
{
    /// Create a new daemon. `resolver` must cover every storage mode the
    /// producer may have used.
    pub fn new(
        queue: Arc<Q>,
        http_client: H,
        resolver: StorageResolver,
        config: DaemonConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        let upstream = UpstreamClient::new(http_client, config.upstream.clone());
        let pipeline = PipelineExecutor::new(
            resolver,
            upstream.clone(),
            Duration::from_millis(config.worker_delay_ms),
        );
        Self {
            worker_id: WorkerId::from(uuid::Uuid::new_v4()),
            queue,
            pipeline,
            upstream,
            config,
            shutdown_token,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Shutdown stops claiming, lets the in-flight job finish, drains the
    /// aggregator, and returns the final statistics.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>) -> Result<GlobalStats> {
        tracing::info!("Worker starting");

        let dispatcher = ReportDispatcher::new(self.upstream.clone());
        let (outcomes, aggregator) = BatchAggregator::new().spawn(dispatcher);

        let janitor = janitor::spawn(
            self.queue.clone(),
            self.config.janitor.clone(),
            self.shutdown_token.clone(),
        );

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let queue = self.queue.clone();
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match queue.counts().await {
                                Ok(counts) => tracing::info!(
                                    waiting = counts.waiting,
                                    active = counts.active,
                                    completed = counts.completed,
                                    failed = counts.failed,
                                    "Queue status"
                                ),
                                Err(e) => tracing::warn!(error = %e, "Failed to read queue counts"),
                            }
                        }
                        _ = shutdown_token.cancelled() => break,
                    }
                }
            });
        }

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if self.shutdown_token.is_cancelled() {
                tracing::info!("Shutdown signal received, stopping worker");
                break;
            }

            let claimed = match self.queue.claim_next(self.worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    None
                }
            };

            match claimed {
                Some(job) => {
                    if let Err(e) = self.process(job, &outcomes).await {
                        tracing::error!(error = %e, "Failed to record job outcome");
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {},
                        _ = self.shutdown_token.cancelled() => {
                            tracing::info!("Shutdown signal received, stopping worker");
                            break;
                        }
                    }
                }
            }
        }

        drop(outcomes);
        let stats = aggregator
            .await
            .map_err(|e| anyhow::anyhow!("Aggregator task panicked: {}", e))?;
        if let Err(e) = janitor.await {
            tracing::error!(error = %e, "Janitor task panicked");
        }

        tracing::info!("Final upload statistics");
        stats.log();
        Ok(stats)
    }

    /// Run one attempt for a claimed job and record what happened.
    #[tracing::instrument(skip(self, job, outcomes), fields(job_id = %job.id, batch_id = %job.data.batch_id, file = %job.data.original_name))]
    async fn process(&self, job: Job<Active>, outcomes: &AggregatorHandle) -> Result<()> {
        let data = job.data.clone();
        let queue = self.queue.as_ref();

        match self.pipeline.execute(data.clone()).await {
            Ok(classification) => {
                let completed = job.complete(classification, queue).await?;
                counter!("courier_attempts_total", "result" => classification.as_str()).increment(1);
                tracing::info!(
                    classification = %classification,
                    attempts = completed.state.attempts_made,
                    "Job completed"
                );

                outcomes
                    .send(OutcomeEvent::from_job(&data, classification))
                    .await?;
                if let Err(e) = self.queue.remove(completed.id).await {
                    tracing::warn!(error = %e, "Failed to remove completed job");
                }
            }
            Err(error) => {
                counter!("courier_attempts_total", "result" => "error").increment(1);
                tracing::warn!(error = %error, "Job attempt failed");

                match job.fail(&error, queue).await? {
                    FailureDisposition::Retrying(waiting) => {
                        tracing::debug!(
                            attempts = waiting.state.attempts_made,
                            not_before = ?waiting.state.not_before,
                            "Job scheduled for retry"
                        );
                    }
                    FailureDisposition::Exhausted(failed) => {
                        tracing::error!(
                            attempts = failed.state.attempts_made,
                            reason = %failed.state.reason,
                            "Job failed permanently"
                        );
                        if let FileRef::Local(path) = &data.file_ref {
                            remove_quietly(path).await;
                        }

                        outcomes
                            .send(OutcomeEvent::from_job(&data, Classification::Failed))
                            .await?;
                        if let Err(e) = self.queue.remove(failed.id).await {
                            tracing::warn!(error = %e, "Failed to remove failed job");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
