//! Periodic removal of old terminal job records.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::JobStateFilter;
use crate::queue::JobQueue;

/// Retention rules for terminal records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// How often to sweep (milliseconds)
    pub interval_ms: u64,
    /// Completed records older than this are eligible for deletion (milliseconds)
    pub completed_grace_ms: u64,
    /// Number of most recent completed records always kept
    pub completed_keep: usize,
    /// Failed records older than this are eligible for deletion (milliseconds)
    pub failed_grace_ms: u64,
    /// Number of most recent failed records always kept
    pub failed_keep: usize,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30 * 60 * 1000,
            completed_grace_ms: 60 * 60 * 1000,
            completed_keep: 100,
            failed_grace_ms: 24 * 60 * 60 * 1000,
            failed_keep: 200,
        }
    }
}

/// Run one sweep over completed and failed records. Errors are logged and
/// ignored; returns how many records were deleted.
pub async fn sweep_once<Q: JobQueue + ?Sized>(queue: &Q, config: &JanitorConfig) -> usize {
    let rules = [
        (
            JobStateFilter::Completed,
            config.completed_grace_ms,
            config.completed_keep,
        ),
        (
            JobStateFilter::Failed,
            config.failed_grace_ms,
            config.failed_keep,
        ),
    ];

    let mut removed = 0;
    for (state, grace_ms, keep) in rules {
        match queue
            .clean(state, Duration::from_millis(grace_ms), keep)
            .await
        {
            Ok(n) => removed += n,
            Err(e) => tracing::error!(state = %state, error = %e, "Queue cleanup failed"),
        }
    }

    tracing::info!(removed, "Queue cleanup completed");
    removed
}

/// Spawn the periodic sweep. The first sweep happens one interval after start.
pub fn spawn<Q: JobQueue + 'static>(
    queue: Arc<Q>,
    config: JanitorConfig,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(config.interval_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tracing::info!(interval_ms = config.interval_ms, "Queue janitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_once(queue.as_ref(), &config).await;
                }
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutting down queue janitor");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Classification;
    use crate::job::{BatchId, Completed, FileRef, Job, JobData, RetryPolicy};
    use crate::queue::InMemoryJobQueue;

    async fn completed(queue: &InMemoryJobQueue, age: chrono::Duration) {
        let waiting = queue
            .enqueue(
                JobData {
                    batch_id: BatchId::from("batch_j"),
                    target_id: "job-1".to_string(),
                    original_name: "a.pdf".to_string(),
                    file_ref: FileRef::local("/tmp/a.pdf"),
                    total_in_batch: 1,
                    location: None,
                    auth_token: None,
                    user_id: None,
                },
                RetryPolicy::default(),
            )
            .await
            .unwrap();
        queue
            .persist(&Job {
                id: waiting.id,
                retry: waiting.retry,
                data: waiting.data,
                state: Completed {
                    classification: Classification::Success,
                    attempts_made: 1,
                    completed_at: chrono::Utc::now() - age,
                },
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_applies_retention_rules() {
        let queue = InMemoryJobQueue::new();
        completed(&queue, chrono::Duration::hours(2)).await;
        completed(&queue, chrono::Duration::hours(3)).await;
        completed(&queue, chrono::Duration::minutes(5)).await;

        let config = JanitorConfig {
            completed_keep: 1,
            ..Default::default()
        };
        assert_eq!(sweep_once(&queue, &config).await, 2);
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_periodic_task_stops_on_shutdown() {
        let queue = Arc::new(InMemoryJobQueue::new());
        completed(&queue, chrono::Duration::hours(2)).await;

        let token = CancellationToken::new();
        let handle = spawn(
            queue.clone(),
            JanitorConfig {
                interval_ms: 10,
                completed_keep: 0,
                ..Default::default()
            },
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(queue.counts().await.unwrap().completed, 0);
    }
}
