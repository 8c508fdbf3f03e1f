//! Batch aggregation and reporting.
//!
//! Domain types live in `domain::batch`; this module adds the components that
//! own batch state at runtime.

pub use crate::domain::batch::{BatchReport, BatchState, Classification, OutcomeEvent};
pub use crate::domain::stats::GlobalStats;

pub mod aggregator;
pub mod report;

pub use aggregator::{AggregatorHandle, BatchAggregator};
pub use report::ReportDispatcher;
