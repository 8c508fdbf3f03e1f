//! Typestate for a single processing attempt.
//!
//! ```text
//! Attempt<Resolving> ──resolve()──> Attempt<Parsing> ──parse()──> Attempt<Submitting>
//!                                                                      │
//!                                                        submit()──────┘
//!                                                                      ▼
//!            Attempt<Done> <──pace()── Attempt<Pacing> <──clean_up()── Attempt<Classified>
//! ```
//!
//! Every step after `resolve` either advances or hands back an [`Aborted`]
//! holding the resolved file, so the caller can delete what the attempt
//! fetched before the error goes to the queue.

use serde_json::{Map, Value};

use crate::batch::Classification;
use crate::error::CourierError;
use crate::job::JobData;
use crate::storage::ResolvedFile;

/// Marker trait for attempt states.
pub trait AttemptState: Send + Sync {}

/// One run of the pipeline for one job.
#[derive(Debug, Clone)]
pub struct Attempt<S: AttemptState> {
    pub data: JobData,
    pub state: S,
}

#[derive(Debug, Clone)]
pub struct Resolving;

impl AttemptState for Resolving {}

#[derive(Debug, Clone)]
pub struct Parsing {
    pub file: ResolvedFile,
}

impl AttemptState for Parsing {}

#[derive(Debug, Clone)]
pub struct Submitting {
    pub file: ResolvedFile,
    /// Parser output with `location` merged in
    pub candidate: Map<String, Value>,
}

impl AttemptState for Submitting {}

#[derive(Debug, Clone)]
pub struct Classified {
    pub file: ResolvedFile,
    pub classification: Classification,
}

impl AttemptState for Classified {}

#[derive(Debug, Clone)]
pub struct Pacing {
    pub classification: Classification,
}

impl AttemptState for Pacing {}

#[derive(Debug, Clone)]
pub struct Done {
    pub classification: Classification,
}

impl AttemptState for Done {}

/// A step failed after the file was resolved.
#[derive(Debug)]
pub struct Aborted {
    pub error: CourierError,
    pub file: ResolvedFile,
}

pub type StepResult<S> = std::result::Result<Attempt<S>, Aborted>;

impl Attempt<Resolving> {
    pub fn new(data: JobData) -> Self {
        Self {
            data,
            state: Resolving,
        }
    }
}

impl Attempt<Done> {
    pub fn classification(&self) -> Classification {
        self.state.classification
    }
}
