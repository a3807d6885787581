//! Pipeline Coordinator
//!
//! Owns the ordered stage list and the worker pool, and drives batches
//! strictly one at a time through every stage in input order. Stage
//! execution is never overlapped across batches, so the `i`-th aggregate
//! always belongs to the `i`-th input batch.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

use crate::{
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    pipeline::{
        aggregate::{BatchAggregate, ResultAggregator},
        observer::BatchObserver,
        stage::{StageOutput, StageSpec},
        worker::StageWorker,
        PipelineReport, StageMetrics,
    },
    types::{Batch, RunId},
};

/// Terminal state machine of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Constructed, not yet run
    Idle,
    /// Workers are up and batches are being routed
    Running,
    /// Every batch went through every stage
    Completed,
    /// A stage reported an error
    Failed,
}

/// Single-run pipeline coordinator
#[derive(Debug)]
pub struct Coordinator {
    config: PipelineConfig,
    stages: Vec<StageSpec>,
    state: RunState,
    run_id: RunId,
}

impl Coordinator {
    /// Create coordinator over a fixed stage list
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the config is invalid, the stage list is
    /// empty, stage names repeat, or a built-in `aggregate` stage is not last
    pub fn new(stages: Vec<StageSpec>, config: PipelineConfig) -> PipelineResult<Self> {
        config.validate_config()?;
        Self::validate_stages(&stages)?;

        Ok(Self {
            config,
            stages,
            state: RunState::Idle,
            run_id: RunId::new(),
        })
    }

    fn validate_stages(stages: &[StageSpec]) -> PipelineResult<()> {
        if stages.is_empty() {
            return Err(PipelineError::configuration(
                "stages",
                "pipeline requires at least one stage",
            ));
        }

        let mut names = HashSet::with_capacity(stages.len());
        for stage in stages {
            if stage.name().is_empty() {
                return Err(PipelineError::configuration("stages", "stage name must not be empty"));
            }
            if !names.insert(stage.name()) {
                return Err(PipelineError::configuration(
                    "stages",
                    format!("duplicate stage name '{}'", stage.name()),
                ));
            }
        }

        let last = stages.len() - 1;
        if let Some((position, stage)) = stages
            .iter()
            .enumerate()
            .take(last)
            .find(|(_, stage)| stage.kind().is_terminal())
        {
            return Err(PipelineError::configuration(
                "stages",
                format!(
                    "aggregate stage '{}' must be the last stage (found at position {position})",
                    stage.name()
                ),
            ));
        }

        Ok(())
    }

    /// Current run state
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Run identifier
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Stages in pipeline order
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Route every batch through every stage
    ///
    /// On the first stage error the remaining batches are skipped, aggregates
    /// already computed are discarded, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first stage error, `WorkerUnavailable` if a worker cannot
    /// be started, or `Configuration` if this coordinator has already run
    pub fn run(
        &mut self,
        batches: Vec<Batch>,
        mut observer: Option<&mut dyn BatchObserver>,
    ) -> PipelineResult<PipelineReport> {
        if self.state != RunState::Idle {
            return Err(PipelineError::configuration(
                "coordinator",
                format!("run {} has already been started", self.run_id),
            ));
        }

        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %self.run_id,
            stages = self.stages.len(),
            batches = batches.len()
        );
        let _guard = span.enter();
        let started = Instant::now();

        let mut workers = match self.spawn_workers() {
            Ok(workers) => workers,
            Err(e) => {
                self.state = RunState::Failed;
                tracing::error!("Pipeline run {} failed to start: {}", self.run_id, e);
                return Err(e);
            }
        };
        self.state = RunState::Running;
        tracing::info!(
            "Pipeline run {} started: {} stages, {} batches",
            self.run_id,
            workers.len(),
            batches.len()
        );

        let mut stage_metrics: Vec<StageMetrics> =
            self.stages.iter().map(|stage| StageMetrics::new(stage.name())).collect();
        let outcome = Self::drive(&workers, batches, &mut stage_metrics, &mut observer);

        for worker in &mut workers {
            if !worker.terminate() {
                tracing::warn!("Stage worker '{}' was abandoned after drain timeout", worker.name());
            }
        }

        match outcome {
            Ok((aggregator, aggregates)) => {
                self.state = RunState::Completed;
                let report = PipelineReport {
                    run_id: self.run_id,
                    global: aggregator.finish(),
                    batches: aggregates,
                    stage_metrics,
                    duration: started.elapsed(),
                };
                tracing::info!(
                    "Pipeline run {} completed: {} batches, {} records in {:?}",
                    self.run_id,
                    report.batches.len(),
                    report.global.count,
                    report.duration
                );
                Ok(report)
            }
            Err(e) => {
                self.state = RunState::Failed;
                #[cfg(feature = "metrics")]
                metrics::counter!("pipeline_runs_failed_total").increment(1);
                tracing::error!("Pipeline run {} failed: {}", self.run_id, e);
                Err(e)
            }
        }
    }

    fn spawn_workers(&self) -> PipelineResult<Vec<StageWorker>> {
        self.stages
            .iter()
            .enumerate()
            .map(|(ordinal, stage)| StageWorker::spawn(stage.clone(), ordinal, &self.config))
            .collect()
    }

    fn drive(
        workers: &[StageWorker],
        batches: Vec<Batch>,
        stage_metrics: &mut [StageMetrics],
        observer: &mut Option<&mut dyn BatchObserver>,
    ) -> PipelineResult<(ResultAggregator, Vec<BatchAggregate>)> {
        let mut aggregator = ResultAggregator::new();
        let mut aggregates = Vec::with_capacity(batches.len());

        for batch in batches {
            let batch_index = batch.index();
            let aggregate = Self::process_batch(workers, batch, stage_metrics)?;
            tracing::debug!(
                "Batch {} aggregated: count={}, sum={}",
                batch_index,
                aggregate.count,
                aggregate.sum
            );

            aggregator.push(&aggregate);
            if let Some(observer) = observer.as_deref_mut() {
                observer.on_batch(batch_index, &aggregate);
            }
            #[cfg(feature = "metrics")]
            metrics::counter!("pipeline_batches_completed_total").increment(1);
            aggregates.push(aggregate);
        }

        Ok((aggregator, aggregates))
    }

    /// Submit the batch to each worker in turn, feeding every output forward
    fn process_batch(
        workers: &[StageWorker],
        batch: Batch,
        stage_metrics: &mut [StageMetrics],
    ) -> PipelineResult<BatchAggregate> {
        let batch_index = batch.index();
        let last = workers.len().saturating_sub(1);
        let mut current = batch;

        for (ordinal, (worker, stage_metric)) in workers.iter().zip(stage_metrics.iter_mut()).enumerate() {
            let records_in = current.len();
            let started = Instant::now();
            let output = worker.submit(current)?;
            let elapsed = started.elapsed();
            stage_metric.record(records_in, output.record_count(), elapsed);
            #[cfg(feature = "metrics")]
            metrics::histogram!("pipeline_stage_duration_seconds", "stage" => worker.name().to_string())
                .record(elapsed.as_secs_f64());

            match output {
                StageOutput::Batch(next) if ordinal < last => {
                    if next.index() != batch_index {
                        return Err(PipelineError::stage_transform(
                            worker.name(),
                            batch_index,
                            format!("stage changed batch index to {}", next.index()),
                        ));
                    }
                    current = next;
                }
                StageOutput::Aggregate(aggregate) if ordinal == last => return Ok(aggregate),
                StageOutput::Batch(_) => {
                    return Err(PipelineError::stage_transform(
                        worker.name(),
                        batch_index,
                        "terminal stage produced a batch instead of an aggregate",
                    ));
                }
                StageOutput::Aggregate(_) => {
                    return Err(PipelineError::stage_transform(
                        worker.name(),
                        batch_index,
                        "non-terminal stage produced an aggregate",
                    ));
                }
            }
        }

        Err(PipelineError::configuration(
            "stages",
            "pipeline requires at least one stage",
        ))
    }
}
