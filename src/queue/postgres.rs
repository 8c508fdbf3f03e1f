//! PostgreSQL implementation of the job queue.
//!
//! Jobs live in the `courier_jobs` table. Claiming uses
//! `SELECT ... FOR UPDATE SKIP LOCKED` so several workers can share one queue,
//! and active jobs whose worker disappeared are reclaimed once they have been
//! active for longer than the stall timeout (at-least-once delivery).
//!
//! # Example
//! ```ignore
//! use courier::queue::PostgresJobQueue;
//!
//! let queue = PostgresJobQueue::connect("postgresql://localhost/courier").await?;
//! queue.migrate().await?;
//! ```

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use uuid::Uuid;

use super::{JobCounts, JobQueue};
use crate::batch::Classification;
use crate::error::{CourierError, Result};
use crate::job::{
    Active, AnyJob, Completed, Failed, Job, JobData, JobId, JobState, JobStateFilter, RetryPolicy,
    Waiting, WorkerId,
};

/// Default time after which an active job is considered abandoned.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// PostgreSQL-backed durable job queue.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    stall_timeout: Duration,
}

fn queue_error(context: &str, e: sqlx::Error) -> CourierError {
    CourierError::Queue(format!("{}: {}", context, e))
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| queue_error("Failed to connect to queue database", e))?;
        Ok(Self::new(pool))
    }

    /// Override how long a job may stay active before another worker reclaims it.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Run the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::migrator()
            .run(&self.pool)
            .await
            .map_err(|e| CourierError::Other(anyhow!("Failed to run queue migrations: {}", e)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_job(row: &PgRow) -> Result<AnyJob> {
        let get_err = |e| queue_error("Failed to decode job row", e);

        let id = JobId(row.try_get::<Uuid, _>("id").map_err(get_err)?);
        let data = row.try_get::<Json<JobData>, _>("data").map_err(get_err)?.0;
        let retry = row
            .try_get::<Json<RetryPolicy>, _>("retry")
            .map_err(get_err)?
            .0;
        let state: String = row.try_get("state").map_err(get_err)?;
        let attempts_made = row.try_get::<i32, _>("attempts_made").map_err(get_err)? as u32;
        let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(get_err)?;

        let job = match state.as_str() {
            "waiting" => AnyJob::Waiting(Job {
                id,
                retry,
                data,
                state: Waiting {
                    attempts_made,
                    not_before: row.try_get("not_before").map_err(get_err)?,
                    enqueued_at,
                    last_error: row.try_get("last_error").map_err(get_err)?,
                },
            }),
            "active" => AnyJob::Active(Job {
                id,
                retry,
                data,
                state: Active {
                    worker_id: WorkerId(row.try_get::<Uuid, _>("worker_id").map_err(get_err)?),
                    claimed_at: row.try_get("claimed_at").map_err(get_err)?,
                    attempts_made,
                    enqueued_at,
                },
            }),
            "completed" => {
                let label: String = row.try_get("classification").map_err(get_err)?;
                AnyJob::Completed(Job {
                    id,
                    retry,
                    data,
                    state: Completed {
                        classification: label
                            .parse::<Classification>()
                            .map_err(CourierError::Queue)?,
                        attempts_made,
                        completed_at: row.try_get("finished_at").map_err(get_err)?,
                    },
                })
            }
            "failed" => AnyJob::Failed(Job {
                id,
                retry,
                data,
                state: Failed {
                    reason: row
                        .try_get::<Option<String>, _>("last_error")
                        .map_err(get_err)?
                        .unwrap_or_default(),
                    attempts_made,
                    failed_at: row.try_get("finished_at").map_err(get_err)?,
                },
            }),
            other => {
                return Err(CourierError::Queue(format!(
                    "Unknown job state '{}' for job {}",
                    other, id
                )));
            }
        };
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[tracing::instrument(skip(self, data, retry), fields(batch_id = %data.batch_id, file = %data.original_name))]
    async fn enqueue(&self, data: JobData, retry: RetryPolicy) -> Result<Job<Waiting>> {
        let id = JobId(Uuid::new_v4());
        let enqueued_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO courier_jobs (id, state, data, retry, attempts_made, enqueued_at)
            VALUES ($1, 'waiting', $2, $3, 0, $4)
            "#,
        )
        .bind(*id)
        .bind(Json(&data))
        .bind(Json(&retry))
        .bind(enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| queue_error("Failed to enqueue job", e))?;

        tracing::debug!(job_id = %id, "Job enqueued");

        Ok(Job {
            id,
            retry,
            data,
            state: Waiting {
                attempts_made: 0,
                not_before: None,
                enqueued_at,
                last_error: None,
            },
        })
    }

    async fn claim_next(&self, worker_id: WorkerId) -> Result<Option<Job<Active>>> {
        let now = Utc::now();
        let stalled_before = now
            - chrono::Duration::from_std(self.stall_timeout)
                .map_err(|e| CourierError::Queue(format!("Invalid stall timeout: {}", e)))?;

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM courier_jobs
                WHERE (state = 'waiting' AND (not_before IS NULL OR not_before <= $2))
                   OR (state = 'active' AND claimed_at < $3)
                ORDER BY enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE courier_jobs j
            SET state = 'active', worker_id = $1, claimed_at = $2
            FROM next
            WHERE j.id = next.id
            RETURNING j.id, j.state, j.data, j.retry, j.attempts_made, j.enqueued_at,
                      j.worker_id, j.claimed_at, j.not_before, j.last_error,
                      j.classification, j.finished_at
            "#,
        )
        .bind(worker_id.0)
        .bind(now)
        .bind(stalled_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| queue_error("Failed to claim job", e))?;

        match row {
            Some(row) => match Self::row_to_job(&row)? {
                AnyJob::Active(job) => Ok(Some(job)),
                other => Err(CourierError::Queue(format!(
                    "Claimed job {} came back in state '{}'",
                    other.id(),
                    other.state()
                ))),
            },
            None => Ok(None),
        }
    }

    async fn persist<T: JobState + Clone>(&self, job: &Job<T>) -> Result<()>
    where
        AnyJob: From<Job<T>>,
    {
        let any = AnyJob::from(job.clone());
        let id = any.id();

        let query = match &any {
            AnyJob::Waiting(j) => sqlx::query(
                r#"
                UPDATE courier_jobs
                SET state = 'waiting', attempts_made = $2, not_before = $3, last_error = $4,
                    worker_id = NULL, claimed_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(*id)
            .bind(j.state.attempts_made as i32)
            .bind(j.state.not_before)
            .bind(j.state.last_error.clone()),
            AnyJob::Active(j) => sqlx::query(
                r#"
                UPDATE courier_jobs
                SET state = 'active', attempts_made = $2, worker_id = $3, claimed_at = $4
                WHERE id = $1
                "#,
            )
            .bind(*id)
            .bind(j.state.attempts_made as i32)
            .bind(j.state.worker_id.0)
            .bind(j.state.claimed_at),
            AnyJob::Completed(j) => sqlx::query(
                r#"
                UPDATE courier_jobs
                SET state = 'completed', attempts_made = $2, classification = $3, finished_at = $4
                WHERE id = $1
                "#,
            )
            .bind(*id)
            .bind(j.state.attempts_made as i32)
            .bind(j.state.classification.as_str())
            .bind(j.state.completed_at),
            AnyJob::Failed(j) => sqlx::query(
                r#"
                UPDATE courier_jobs
                SET state = 'failed', attempts_made = $2, last_error = $3, finished_at = $4
                WHERE id = $1
                "#,
            )
            .bind(*id)
            .bind(j.state.attempts_made as i32)
            .bind(j.state.reason.clone())
            .bind(j.state.failed_at),
        };

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| queue_error("Failed to persist job", e))?;

        if result.rows_affected() == 0 {
            return Err(CourierError::JobNotFound(id));
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<AnyJob> {
        let row = sqlx::query(
            r#"
            SELECT id, state, data, retry, attempts_made, enqueued_at, worker_id, claimed_at,
                   not_before, last_error, classification, finished_at
            FROM courier_jobs
            WHERE id = $1
            "#,
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| queue_error("Failed to fetch job", e))?
        .ok_or(CourierError::JobNotFound(id))?;

        Self::row_to_job(&row)
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM courier_jobs WHERE id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await
            .map_err(|e| queue_error("Failed to remove job", e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn clean(&self, state: JobStateFilter, grace: Duration, keep: usize) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace)
                .map_err(|e| CourierError::Queue(format!("Invalid grace period: {}", e)))?;

        let result = sqlx::query(
            r#"
            DELETE FROM courier_jobs
            WHERE id IN (
                SELECT id
                FROM courier_jobs
                WHERE state = $1
                ORDER BY finished_at DESC
                OFFSET $3
            )
            AND finished_at < $2
            "#,
        )
        .bind(state.as_str())
        .bind(cutoff)
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| queue_error("Failed to clean jobs", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM courier_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| queue_error("Failed to count jobs", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| queue_error("Failed to decode count row", e))?;
            let n = row
                .try_get::<i64, _>("n")
                .map_err(|e| queue_error("Failed to decode count row", e))? as u64;
            match state.as_str() {
                "waiting" => counts.waiting = n,
                "active" => counts.active = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BatchId, FileRef, FailureDisposition};

    fn job_data() -> JobData {
        JobData {
            batch_id: BatchId::from("batch_pg"),
            target_id: "job-7".to_string(),
            original_name: "cv.pdf".to_string(),
            file_ref: FileRef::remote("cv-bucket", "batch_pg/cv.pdf"),
            total_in_batch: 1,
            location: Some("Lisbon".to_string()),
            auth_token: Some("tok".to_string()),
            user_id: None,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_enqueue_claim_complete(pool: PgPool) {
        let queue = PostgresJobQueue::new(pool);
        let worker = WorkerId(Uuid::new_v4());

        let waiting = queue
            .enqueue(job_data(), RetryPolicy::default())
            .await
            .unwrap();
        let active = queue.claim_next(worker).await.unwrap().unwrap();
        assert_eq!(active.id, waiting.id);
        assert_eq!(active.data, job_data());
        assert!(queue.claim_next(worker).await.unwrap().is_none());

        active
            .complete(Classification::Success, &queue)
            .await
            .unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_retry_gate_and_stall_reclaim(pool: PgPool) {
        let queue = PostgresJobQueue::new(pool).with_stall_timeout(Duration::from_millis(0));
        let worker = WorkerId(Uuid::new_v4());
        queue
            .enqueue(job_data(), RetryPolicy::default())
            .await
            .unwrap();

        let active = queue.claim_next(worker).await.unwrap().unwrap();
        let error = CourierError::Resolution {
            reference: "s3://cv-bucket/batch_pg/cv.pdf".to_string(),
            reason: "not found".to_string(),
        };
        let FailureDisposition::Retrying(waiting) = active.fail(&error, &queue).await.unwrap()
        else {
            panic!("Expected retry");
        };
        assert_eq!(waiting.state.attempts_made, 1);

        // Gated by a 2s backoff
        assert!(queue.claim_next(worker).await.unwrap().is_none());

        match queue.get_job(waiting.id).await.unwrap() {
            AnyJob::Waiting(j) => assert!(j.state.last_error.unwrap().contains("not found")),
            other => panic!("Expected Waiting, got {}", other.state()),
        }
    }
}
