//! Pipeline Processing Module
//!
//! Linear multi-stage batch pipeline: one worker thread per stage, driven by a
//! single coordinator that routes each batch through every stage in order.

pub mod aggregate;
pub mod coordinator;
pub mod observer;
pub mod stage;
pub mod worker;

pub use aggregate::{BatchAggregate, GlobalAggregate, ResultAggregator};
pub use coordinator::{Coordinator, RunState};
pub use observer::{BatchObserver, NoopObserver};
pub use stage::{builtin_stages, CustomTransform, StageKind, StageOutput, StageSpec};
pub use worker::{StageWorker, WorkerState};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::RunId;

/// Per-stage processing metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Stage name
    pub stage_name: String,

    /// Number of batches processed
    pub batches_processed: u64,

    /// Records received
    pub records_in: u64,

    /// Records emitted (aggregate count for the terminal stage)
    pub records_out: u64,

    /// Total processing time in microseconds
    pub total_processing_time_us: u64,

    /// Average processing time per batch in microseconds
    pub avg_processing_time_us: u64,
}

impl StageMetrics {
    /// Create new stage metrics
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            batches_processed: 0,
            records_in: 0,
            records_out: 0,
            total_processing_time_us: 0,
            avg_processing_time_us: 0,
        }
    }

    /// Record one stage hop
    pub fn record(&mut self, records_in: usize, records_out: usize, elapsed: Duration) {
        self.batches_processed += 1;
        self.records_in += records_in as u64;
        self.records_out += records_out as u64;
        self.total_processing_time_us += u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.avg_processing_time_us = self.total_processing_time_us / self.batches_processed;
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run identifier
    pub run_id: RunId,
    /// Cross-batch aggregate
    pub global: GlobalAggregate,
    /// Per-batch aggregates; element `i` belongs to input batch `i`
    pub batches: Vec<BatchAggregate>,
    /// Metrics per stage, in pipeline order
    pub stage_metrics: Vec<StageMetrics>,
    /// Wall-clock run time
    pub duration: Duration,
}

impl PipelineReport {
    /// Split into the global and per-batch aggregates
    #[must_use]
    pub fn into_parts(self) -> (GlobalAggregate, Vec<BatchAggregate>) {
        (self.global, self.batches)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)] // Tests may unwrap, panic and index
mod tests {
    use super::*;

    #[test]
    fn test_stage_metrics_record() {
        let mut metrics = StageMetrics::new("filter");
        metrics.record(100, 40, Duration::from_micros(30));
        metrics.record(100, 60, Duration::from_micros(10));

        assert_eq!(metrics.batches_processed, 2);
        assert_eq!(metrics.records_in, 200);
        assert_eq!(metrics.records_out, 100);
        assert_eq!(metrics.total_processing_time_us, 40);
        assert_eq!(metrics.avg_processing_time_us, 20);
    }
}
