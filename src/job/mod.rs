//! Job aggregate.
//!
//! This module re-exports types from `domain::job`.
//! See that module for the actual implementations.

pub use crate::domain::job::{state::*, transitions::FailureDisposition};
