//! `TallyIO` Batch Pipeline - Thread-per-Stage Batch Processing
//!
//! This crate runs batches of raw numeric records through a fixed, linear
//! sequence of stages, each hosted on its own worker thread, and returns one
//! aggregate per batch plus a cross-batch summary.

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::large_stack_arrays,
    clippy::indexing_slicing,
    missing_docs
)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::correctness,
    clippy::suspicious,
    clippy::perf,
    clippy::style,
    clippy::complexity,
    clippy::manual_let_else,
    clippy::needless_pass_by_ref_mut,
    clippy::cast_possible_truncation,
    clippy::float_cmp
)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::cast_precision_loss)] // Record counts are averaged as f64
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Error documentation is handled at module level
//!
//! # Features
//!
//! - **Built-in stages**: parse, transform, filter (25 < v < 75), aggregate
//! - **Custom stages**: any `Fn(Batch) -> anyhow::Result<StageOutput>`
//! - **Strict ordering**: batches are processed one at a time, in input order
//! - **Fail-fast**: the first stage error aborts the run, naming stage and batch
//! - **Bounded shutdown**: workers are drained with a timeout, never hang the caller
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────── Coordinator ────────────────────┐
//!  batches ──▶ │ parse ──▶ transform ──▶ filter ──▶ aggregate        │ ──▶ report
//!              │ (thread)  (thread)      (thread)   (thread)         │
//!              └───────────────── ResultAggregator ──────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use tallyio_batch_pipeline::{builtin_stages, run_pipeline, Batch, PipelineResult};
//!
//! fn main() -> PipelineResult<()> {
//!     let batches = Batch::chunk_raw(["10", "30", "50", "70", "90"], 5);
//!     let (global, per_batch) = run_pipeline(builtin_stages(), batches)?;
//!
//!     assert_eq!(global.count, 3);
//!     assert_eq!(per_batch.len(), 1);
//!     Ok(())
//! }
//! ```

// Internal modules
pub mod config;
pub mod error;
pub mod types;

// Pipeline processing
pub mod pipeline;

// Public exports
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, StageFailure};
pub use pipeline::{
    builtin_stages, BatchAggregate, BatchObserver, Coordinator, CustomTransform, GlobalAggregate,
    NoopObserver, PipelineReport, ResultAggregator, RunState, StageKind, StageMetrics, StageOutput,
    StageSpec, StageWorker, WorkerState,
};
pub use types::{Batch, BatchIndex, ParsedRecord, RawRecord, Record, RunId, TransformedRecord};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run batches through the stages with the default configuration
///
/// # Errors
///
/// Returns the first stage error; no partial results are returned
pub fn run_pipeline(
    stages: Vec<StageSpec>,
    batches: Vec<Batch>,
) -> PipelineResult<(GlobalAggregate, Vec<BatchAggregate>)> {
    run_pipeline_with_config(stages, batches, PipelineConfig::default()).map(PipelineReport::into_parts)
}

/// Run batches through the stages and return the full report
///
/// # Errors
///
/// Returns `Configuration` for an invalid config or stage list, otherwise the
/// first stage error
pub fn run_pipeline_with_config(
    stages: Vec<StageSpec>,
    batches: Vec<Batch>,
    config: PipelineConfig,
) -> PipelineResult<PipelineReport> {
    Coordinator::new(stages, config)?.run(batches, None)
}

/// Chunk raw values into batches of `config.batch_size` and run them
///
/// # Errors
///
/// Same as [`run_pipeline_with_config`]
pub fn run_pipeline_on_values<I, S>(
    stages: Vec<StageSpec>,
    values: I,
    config: PipelineConfig,
) -> PipelineResult<PipelineReport>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    config.validate_config()?;
    let batches = Batch::chunk_raw(values, config.batch_size);
    run_pipeline_with_config(stages, batches, config)
}

/// Run batches through the stages, reporting every completed batch to `observer`
///
/// # Errors
///
/// Same as [`run_pipeline_with_config`]
pub fn run_pipeline_with_observer(
    stages: Vec<StageSpec>,
    batches: Vec<Batch>,
    config: PipelineConfig,
    observer: &mut dyn BatchObserver,
) -> PipelineResult<PipelineReport> {
    Coordinator::new(stages, config)?.run(batches, Some(observer))
}

/// Run the pipeline on the tokio blocking pool
///
/// # Errors
///
/// Same as [`run_pipeline_with_config`]; a lost blocking task is reported as
/// `WorkerUnavailable` for the coordinator
pub async fn run_pipeline_async(
    stages: Vec<StageSpec>,
    batches: Vec<Batch>,
    config: PipelineConfig,
) -> PipelineResult<PipelineReport> {
    tokio::task::spawn_blocking(move || run_pipeline_with_config(stages, batches, config))
        .await
        .map_err(|e| PipelineError::worker_unavailable("coordinator", e.to_string()))?
}
