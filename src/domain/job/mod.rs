//! Job aggregate - domain model and queue lifecycle transitions.
//!
//! This module contains the core domain logic for jobs:
//! - Job payload and value objects (BatchId, FileRef, RetryPolicy)
//! - Queue record states (typestate pattern)
//! - State transition methods

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::FailureDisposition;
