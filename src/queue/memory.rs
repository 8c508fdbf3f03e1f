//! In-process job queue.
//!
//! Jobs are kept in enqueue order; claiming picks the oldest job whose backoff
//! gate has passed. Used by tests and by single-process deployments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{JobCounts, JobQueue};
use crate::error::{CourierError, Result};
use crate::job::{
    Active, AnyJob, Job, JobData, JobId, JobState, JobStateFilter, RetryPolicy, Waiting, WorkerId,
};

#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<AnyJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record currently held.
    pub fn snapshot(&self) -> Vec<AnyJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, data: JobData, retry: RetryPolicy) -> Result<Job<Waiting>> {
        let job = Job {
            id: JobId(uuid::Uuid::new_v4()),
            retry,
            data,
            state: Waiting {
                attempts_made: 0,
                not_before: None,
                enqueued_at: Utc::now(),
                last_error: None,
            },
        };
        self.jobs.lock().push(job.clone().into());
        Ok(job)
    }

    async fn claim_next(&self, worker_id: WorkerId) -> Result<Option<Job<Active>>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        let slot = jobs.iter_mut().find(|job| match job {
            AnyJob::Waiting(j) => j.state.not_before.is_none_or(|gate| gate <= now),
            _ => false,
        });

        let Some(slot) = slot else {
            return Ok(None);
        };
        let AnyJob::Waiting(waiting) = slot.clone() else {
            return Ok(None);
        };

        let active = Job {
            id: waiting.id,
            retry: waiting.retry,
            data: waiting.data,
            state: Active {
                worker_id,
                claimed_at: now,
                attempts_made: waiting.state.attempts_made,
                enqueued_at: waiting.state.enqueued_at,
            },
        };
        *slot = active.clone().into();
        Ok(Some(active))
    }

    async fn persist<T: JobState + Clone>(&self, job: &Job<T>) -> Result<()>
    where
        AnyJob: From<Job<T>>,
    {
        let mut jobs = self.jobs.lock();
        let slot = jobs
            .iter_mut()
            .find(|j| j.id() == job.id)
            .ok_or(CourierError::JobNotFound(job.id))?;
        *slot = AnyJob::from(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<AnyJob> {
        self.jobs
            .lock()
            .iter()
            .find(|j| j.id() == id)
            .cloned()
            .ok_or(CourierError::JobNotFound(id))
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        self.jobs.lock().retain(|j| j.id() != id);
        Ok(())
    }

    async fn clean(&self, state: JobStateFilter, grace: Duration, keep: usize) -> Result<usize> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| CourierError::Queue(format!("Invalid grace period: {}", e)))?;
        let cutoff = Utc::now() - grace;
        let mut jobs = self.jobs.lock();

        let mut finished: Vec<(JobId, chrono::DateTime<Utc>)> = jobs
            .iter()
            .filter(|j| j.state() == state)
            .filter_map(|j| j.finished_at().map(|at| (j.id(), at)))
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        let doomed: Vec<JobId> = finished
            .into_iter()
            .skip(keep)
            .filter(|(_, at)| *at < cutoff)
            .map(|(id, _)| id)
            .collect();

        jobs.retain(|j| !doomed.contains(&j.id()));
        Ok(doomed.len())
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.jobs.lock().iter() {
            match job.state() {
                JobStateFilter::Waiting => counts.waiting += 1,
                JobStateFilter::Active => counts.active += 1,
                JobStateFilter::Completed => counts.completed += 1,
                JobStateFilter::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
