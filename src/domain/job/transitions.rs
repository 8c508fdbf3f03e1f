//! State transitions for queued jobs using the typestate pattern.
//!
//! ```text
//! enqueue() ──> Job<Waiting> ──claim_next()──> Job<Active> ──complete()──> Job<Completed>
//!                    ^                              │
//!                    └──────── fail() (retry) ──────┤
//!                                                   └──fail() (exhausted)──> Job<Failed>
//! ```
//!
//! Claiming is done atomically by the queue itself. The transitions here apply
//! the job's own [`RetryPolicy`](super::RetryPolicy): a failed attempt either
//! goes back to `Waiting` behind an exponential backoff gate or, once the
//! attempt budget is spent, becomes terminally `Failed`.

use metrics::counter;

use super::state::{Active, Completed, Failed, Job, Waiting};
use crate::domain::batch::Classification;
use crate::error::{CourierError, Result};
use crate::queue::JobQueue;

/// What happened to a job after a failed attempt.
#[derive(Debug)]
pub enum FailureDisposition {
    /// Another attempt is scheduled.
    Retrying(Job<Waiting>),
    /// No attempts remain.
    Exhausted(Job<Failed>),
}

impl Job<Active> {
    /// Record a non-error terminal classification.
    pub async fn complete<Q: JobQueue + ?Sized>(
        self,
        classification: Classification,
        queue: &Q,
    ) -> Result<Job<Completed>> {
        let job = Job {
            id: self.id,
            retry: self.retry,
            data: self.data,
            state: Completed {
                classification,
                attempts_made: self.state.attempts_made + 1,
                completed_at: chrono::Utc::now(),
            },
        };
        queue.persist(&job).await?;
        Ok(job)
    }

    /// Record a failed attempt and apply the job's retry policy.
    ///
    /// Non-retriable errors fail the job immediately regardless of the
    /// remaining attempt budget.
    pub async fn fail<Q: JobQueue + ?Sized>(
        self,
        error: &CourierError,
        queue: &Q,
    ) -> Result<FailureDisposition> {
        let attempts_made = self.state.attempts_made + 1;
        let now = chrono::Utc::now();

        if error.is_retriable() && self.retry.allows_another(attempts_made) {
            let backoff_ms = self.retry.backoff_ms(attempts_made);
            let not_before = now + chrono::Duration::milliseconds(backoff_ms as i64);

            counter!("courier_job_retries_total", "reason" => error.kind()).increment(1);
            tracing::info!(
                job_id = %self.id,
                attempts_made,
                max_attempts = self.retry.attempts,
                backoff_ms,
                not_before = %not_before,
                "Retrying failed job with exponential backoff"
            );

            let job = Job {
                id: self.id,
                retry: self.retry,
                data: self.data,
                state: Waiting {
                    attempts_made,
                    not_before: Some(not_before),
                    enqueued_at: self.state.enqueued_at,
                    last_error: Some(error.to_string()),
                },
            };
            queue.persist(&job).await?;
            return Ok(FailureDisposition::Retrying(job));
        }

        tracing::warn!(
            job_id = %self.id,
            attempts_made,
            max_attempts = self.retry.attempts,
            retriable = error.is_retriable(),
            "No attempts remaining, job failed permanently"
        );

        let job = Job {
            id: self.id,
            retry: self.retry,
            data: self.data,
            state: Failed {
                reason: error.to_string(),
                attempts_made,
                failed_at: now,
            },
        };
        queue.persist(&job).await?;
        Ok(FailureDisposition::Exhausted(job))
    }
}
