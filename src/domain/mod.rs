//! Core domain types for the intake and processing pipeline.
//!
//! This module contains pure domain types with no transport dependencies:
//! - Jobs and their queue lifecycle
//! - Outcome classification, batch counters and reports
//! - Process-wide statistics

pub mod batch;
pub mod job;
pub mod stats;
