//! Queue transport capability.
//!
//! The worker only relies on the `JobQueue` trait: at-least-once delivery of
//! job records, a per-job retry policy applied through the record's state
//! transitions, removal, and age-based cleanup. Two transports implement it:
//! an in-process queue and (behind the `postgres` feature) a durable queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::job::{
    Active, AnyJob, Job, JobData, JobId, JobState, JobStateFilter, RetryPolicy, Waiting, WorkerId,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryJobQueue;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobQueue;

/// Number of records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Storage trait for the job queue.
///
/// The type system ensures valid state transitions, so implementations don't
/// need to validate them.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job in the Waiting state, claimable immediately.
    async fn enqueue(&self, data: JobData, retry: RetryPolicy) -> Result<Job<Waiting>>;

    /// Atomically claim the oldest claimable waiting job, if any.
    ///
    /// A job is claimable when its backoff gate (`not_before`) has passed.
    async fn claim_next(&self, worker_id: WorkerId) -> Result<Option<Job<Active>>>;

    /// Update an existing job's state in storage.
    async fn persist<T: JobState + Clone>(&self, job: &Job<T>) -> Result<()>
    where
        AnyJob: From<Job<T>>;

    /// Get a job record in whatever state it is in.
    async fn get_job(&self, id: JobId) -> Result<AnyJob>;

    /// Delete a job record. Removing an unknown id is not an error.
    async fn remove(&self, id: JobId) -> Result<()>;

    /// Delete terminal records in `state` that finished more than `grace` ago,
    /// always keeping the `keep` most recently finished ones.
    ///
    /// Returns the number of records deleted.
    async fn clean(&self, state: JobStateFilter, grace: Duration, keep: usize) -> Result<usize>;

    /// Count records per state.
    async fn counts(&self) -> Result<JobCounts>;
}
