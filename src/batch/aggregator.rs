//! Per-batch completion tracking.
//!
//! The aggregator owns every [`BatchState`]. Workers never touch it directly;
//! they send one [`OutcomeEvent`] per terminal job outcome through an
//! [`AggregatorHandle`], and the aggregator task reports each batch exactly
//! once when its counters reach the total fixed at enqueue time.

use std::collections::{HashMap, HashSet, VecDeque};

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BatchState, GlobalStats, OutcomeEvent, ReportDispatcher};
use crate::error::{CourierError, Result};
use crate::http::HttpClient;
use crate::job::BatchId;

/// Default number of completed batch ids remembered to reject late events.
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 10_000;

const CHANNEL_CAPACITY: usize = 256;

/// Sending side of the outcome channel.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<OutcomeEvent>,
}

impl AggregatorHandle {
    /// Forward one terminal outcome to the aggregator task.
    pub async fn send(&self, event: OutcomeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CourierError::Shutdown)
    }
}

/// Batch store plus process-lifetime statistics.
#[derive(Debug)]
pub struct BatchAggregator {
    batches: HashMap<BatchId, BatchState>,
    completed: HashSet<BatchId>,
    completed_order: VecDeque<BatchId>,
    tombstone_capacity: usize,
    stats: GlobalStats,
}

impl Default for BatchAggregator {
    fn default() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }
}

impl BatchAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_capacity(tombstone_capacity: usize) -> Self {
        Self {
            batches: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            tombstone_capacity,
            stats: GlobalStats::default(),
        }
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    /// Number of batches still waiting for outcomes.
    pub fn pending_batches(&self) -> usize {
        self.batches.len()
    }

    /// Apply one outcome. Returns the batch state, removed from tracking, when
    /// this event completes the batch.
    pub fn on_outcome(&mut self, event: OutcomeEvent) -> Option<BatchState> {
        self.stats.record(event.classification, &event.file_name);
        counter!("courier_jobs_total", "outcome" => event.classification.as_str()).increment(1);

        if self.completed.contains(&event.batch_id) {
            tracing::warn!(
                batch_id = %event.batch_id,
                file = %event.file_name,
                "Outcome for an already reported batch, ignoring"
            );
            return None;
        }

        let batch = self
            .batches
            .entry(event.batch_id.clone())
            .or_insert_with(|| BatchState::new(&event));

        if !batch.record(event.classification, &event.file_name) {
            tracing::warn!(
                batch_id = %event.batch_id,
                file = %event.file_name,
                total = batch.total_files,
                "Outcome would exceed batch total, ignoring"
            );
            return None;
        }

        tracing::debug!(
            batch_id = %event.batch_id,
            completed = batch.completed_count(),
            total = batch.total_files,
            "Batch progress"
        );

        if !batch.is_complete() {
            return None;
        }

        let done = self.batches.remove(&event.batch_id)?;
        self.remember_completed(done.batch_id.clone());
        tracing::info!(
            batch_id = %done.batch_id,
            success = done.success_count,
            already_processed = done.already_processed_count,
            failed = done.failed_count,
            "Batch completed"
        );
        Some(done)
    }

    /// Apply one outcome and log the running totals. File names are only
    /// logged when a batch completes.
    fn observe(&mut self, event: OutcomeEvent) -> Option<BatchState> {
        let completed = self.on_outcome(event);
        if completed.is_some() {
            self.stats.log();
        } else {
            self.stats.log_counts();
        }
        completed
    }

    fn remember_completed(&mut self, batch_id: BatchId) {
        if self.tombstone_capacity == 0 {
            return;
        }
        if self.completed_order.len() >= self.tombstone_capacity
            && let Some(oldest) = self.completed_order.pop_front()
        {
            self.completed.remove(&oldest);
        }
        self.completed.insert(batch_id.clone());
        self.completed_order.push_back(batch_id);
    }

    /// Consume events until every handle is dropped, dispatching a report for
    /// each completed batch. Returns the final statistics.
    pub async fn run<H: HttpClient>(
        mut self,
        mut rx: mpsc::Receiver<OutcomeEvent>,
        dispatcher: ReportDispatcher<H>,
    ) -> GlobalStats {
        while let Some(event) = rx.recv().await {
            let completed = self.observe(event);
            if let Some(batch) = completed {
                dispatcher.dispatch(&batch).await;
            }
        }

        if !self.batches.is_empty() {
            tracing::warn!(
                pending = self.batches.len(),
                "Aggregator stopped with incomplete batches"
            );
        }
        self.stats
    }

    /// Spawn the aggregator task.
    pub fn spawn<H: HttpClient + 'static>(
        self,
        dispatcher: ReportDispatcher<H>,
    ) -> (AggregatorHandle, JoinHandle<GlobalStats>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx, dispatcher));
        (AggregatorHandle { tx }, task)
    }
}
