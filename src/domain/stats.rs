//! Process-lifetime outcome counters, kept for logging only.

use serde::Serialize;

use super::batch::Classification;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total: u64,
    pub success: u64,
    pub already_processed: u64,
    pub failed: u64,
    pub already_processed_files: Vec<String>,
    pub failed_files: Vec<String>,
}

impl GlobalStats {
    pub fn record(&mut self, classification: Classification, file_name: &str) {
        self.total += 1;
        match classification {
            Classification::Success => self.success += 1,
            Classification::AlreadyProcessed => {
                self.already_processed += 1;
                self.already_processed_files.push(file_name.to_string());
            }
            Classification::Failed => {
                self.failed += 1;
                self.failed_files.push(file_name.to_string());
            }
        }
    }

    /// Log the counters only.
    pub fn log_counts(&self) {
        tracing::info!(
            total = self.total,
            success = self.success,
            already_processed = self.already_processed,
            failed = self.failed,
            "Upload statistics"
        );
    }

    /// Log the counters and every already-applied and failed file name.
    pub fn log(&self) {
        self.log_counts();
        for (idx, file) in self.already_processed_files.iter().enumerate() {
            tracing::info!(index = idx + 1, file = %file, "Already applied");
        }
        for (idx, file) in self.failed_files.iter().enumerate() {
            tracing::info!(index = idx + 1, file = %file, "Failed");
        }
    }
}
