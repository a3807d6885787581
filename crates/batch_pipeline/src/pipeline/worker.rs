//! Stage Worker - one persistent thread per pipeline stage
//!
//! The coordinator is the only producer into a worker mailbox and the only
//! consumer of its replies. Batches are moved across the boundary, so workers
//! share no memory with each other.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    pipeline::stage::{StageOutput, StageSpec},
    types::Batch,
};

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting for a batch
    Idle = 0,
    /// Applying the stage transform
    Busy = 1,
    /// Thread has exited or was abandoned
    Terminated = 2,
}

impl WorkerState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Busy,
            2 => Self::Terminated,
            _ => Self::Idle,
        }
    }
}

/// Shared flag telling the worker thread to stop before its next batch
#[derive(Debug, Clone, Default)]
struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
}

impl ShutdownSignal {
    fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

enum WorkerCommand {
    Process { sequence: u64, batch: Batch },
    Shutdown,
}

type WorkerReply = PipelineResult<StageOutput>;

/// Reply tagged with the submission sequence it answers
type SequencedReply = (u64, WorkerReply);

/// Persistent execution unit bound to exactly one stage
#[derive(Debug)]
pub struct StageWorker {
    stage_name: String,
    ordinal: usize,
    state: Arc<AtomicU8>,
    shutdown_signal: ShutdownSignal,
    command_sender: Option<Sender<WorkerCommand>>,
    reply_receiver: Receiver<SequencedReply>,
    next_sequence: AtomicU64,
    in_flight: AtomicBool,
    thread_handle: Option<thread::JoinHandle<()>>,
    stage_timeout: Option<Duration>,
    drain_timeout: Duration,
}

impl StageWorker {
    /// Spawn the worker thread for `stage`
    ///
    /// # Errors
    ///
    /// Returns `WorkerUnavailable` if the thread cannot be spawned
    pub fn spawn(stage: StageSpec, ordinal: usize, config: &PipelineConfig) -> PipelineResult<Self> {
        let stage_name = stage.name().to_string();
        let (command_sender, command_receiver) = channel::bounded(config.mailbox_capacity);
        let (reply_sender, reply_receiver) = channel::bounded(1);
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let shutdown_signal = ShutdownSignal::default();

        let thread_state = Arc::clone(&state);
        let thread_signal = shutdown_signal.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("{}-{}", config.thread_name_prefix, stage_name))
            .spawn(move || {
                Self::worker_loop(
                    &stage,
                    &command_receiver,
                    &reply_sender,
                    &thread_state,
                    &thread_signal,
                );
            })
            .map_err(|e| {
                PipelineError::worker_unavailable(
                    stage_name.as_str(),
                    format!("Failed to start worker thread: {e}"),
                )
            })?;

        tracing::debug!("Stage worker '{}' started at position {}", stage_name, ordinal);

        Ok(Self {
            stage_name,
            ordinal,
            state,
            shutdown_signal,
            command_sender: Some(command_sender),
            reply_receiver,
            next_sequence: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            thread_handle: Some(thread_handle),
            stage_timeout: config.stage_timeout(),
            drain_timeout: config.drain_timeout(),
        })
    }

    /// Worker main loop
    fn worker_loop(
        stage: &StageSpec,
        command_receiver: &Receiver<WorkerCommand>,
        reply_sender: &Sender<SequencedReply>,
        state: &AtomicU8,
        shutdown_signal: &ShutdownSignal,
    ) {
        // Disconnection means the coordinator dropped the worker
        while let Ok(command) = command_receiver.recv() {
            if shutdown_signal.is_shutdown() {
                break;
            }

            let (sequence, batch) = match command {
                WorkerCommand::Process { sequence, batch } => (sequence, batch),
                WorkerCommand::Shutdown => break,
            };

            state.store(WorkerState::Busy as u8, Ordering::Release);
            let batch_index = batch.index();
            let started = Instant::now();
            let reply = Self::run_stage(stage, batch);
            tracing::debug!(
                "Stage '{}' finished batch {} in {:?} (ok: {})",
                stage.name(),
                batch_index,
                started.elapsed(),
                reply.is_ok()
            );
            state.store(WorkerState::Idle as u8, Ordering::Release);

            if reply_sender.send((sequence, reply)).is_err() {
                break;
            }
        }

        state.store(WorkerState::Terminated as u8, Ordering::Release);
    }

    /// Apply the stage, converting failures and panics into tagged errors
    fn run_stage(stage: &StageSpec, batch: Batch) -> WorkerReply {
        let batch_index = batch.index();
        match panic::catch_unwind(AssertUnwindSafe(|| stage.apply(batch))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => Err(failure.into_pipeline_error(stage.name(), batch_index)),
            Err(payload) => Err(PipelineError::stage_transform(
                stage.name(),
                batch_index,
                format!("stage panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }

    /// Stage name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.stage_name
    }

    /// Position in the pipeline
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Current worker state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        if self.thread_handle.is_none() {
            return WorkerState::Terminated;
        }
        match WorkerState::from_raw(self.state.load(Ordering::Acquire)) {
            WorkerState::Idle if self.in_flight.load(Ordering::Acquire) => WorkerState::Busy,
            state => state,
        }
    }

    /// Check if the worker can no longer accept batches
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state() == WorkerState::Terminated
    }

    /// Submit one batch and wait for the stage result
    ///
    /// # Errors
    ///
    /// Returns the tagged stage error, `StageTimeout` if the configured
    /// deadline elapses, or `WorkerUnavailable` if the worker is terminated
    /// or still busy with an earlier submission
    pub fn submit(&self, batch: Batch) -> PipelineResult<StageOutput> {
        // Only the claim holder may send or read replies
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.still_busy());
        }
        let _claim = InFlightClaim(&self.in_flight);

        let raw_state = WorkerState::from_raw(self.state.load(Ordering::Acquire));
        let sender = match (&self.command_sender, self.thread_handle.is_some(), raw_state) {
            (Some(sender), true, WorkerState::Idle) => sender,
            (Some(_), true, WorkerState::Busy) => return Err(self.still_busy()),
            _ => {
                return Err(PipelineError::worker_unavailable(
                    self.stage_name.as_str(),
                    "worker is terminated",
                ))
            }
        };

        let batch_index = batch.index();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        sender
            .send(WorkerCommand::Process { sequence, batch })
            .map_err(|_| {
                PipelineError::worker_unavailable(self.stage_name.as_str(), "worker mailbox is closed")
            })?;

        let deadline = self
            .stage_timeout
            .map(|timeout| (timeout, Instant::now() + timeout));
        loop {
            let (reply_sequence, reply) = match deadline {
                Some((timeout, deadline)) => {
                    self.reply_receiver.recv_deadline(deadline).map_err(|e| match e {
                        RecvTimeoutError::Timeout => PipelineError::stage_timeout(
                            self.stage_name.as_str(),
                            batch_index,
                            timeout,
                        ),
                        RecvTimeoutError::Disconnected => self.thread_gone(),
                    })?
                }
                None => self.reply_receiver.recv().map_err(|_| self.thread_gone())?,
            };

            if reply_sequence == sequence {
                return reply;
            }
            tracing::debug!(
                "Stage '{}' discarded stale reply {} while waiting for {}",
                self.stage_name,
                reply_sequence,
                sequence
            );
        }
    }

    fn still_busy(&self) -> PipelineError {
        PipelineError::worker_unavailable(
            self.stage_name.as_str(),
            "worker is still busy with an earlier batch",
        )
    }

    fn thread_gone(&self) -> PipelineError {
        PipelineError::worker_unavailable(
            self.stage_name.as_str(),
            "worker thread exited before replying",
        )
    }

    /// Stop the worker, waiting at most the configured drain timeout
    ///
    /// Idempotent. Returns `false` if the thread did not exit within the
    /// grace period; it is then abandoned and exits on its own once its
    /// current transform returns.
    pub fn terminate(&mut self) -> bool {
        let Some(handle) = self.thread_handle.take() else {
            return true;
        };

        self.shutdown_signal.signal();
        if let Some(sender) = self.command_sender.take() {
            // A full mailbox is fine: dropping the sender disconnects it
            let _ = sender.try_send(WorkerCommand::Shutdown);
        }

        let (done_sender, done_receiver) = channel::bounded(1);
        let joiner = thread::Builder::new()
            .name(format!("{}-join", self.stage_name))
            .spawn(move || {
                let _ = done_sender.send(handle.join().is_ok());
            });
        if joiner.is_err() {
            tracing::warn!("Could not spawn join thread for stage worker '{}'", self.stage_name);
            return false;
        }

        match done_receiver.recv_timeout(self.drain_timeout) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Stage worker '{}' thread panicked", self.stage_name);
                true
            }
            Err(_) => {
                tracing::warn!(
                    "Stage worker '{}' did not stop within {:?}, abandoning it",
                    self.stage_name,
                    self.drain_timeout
                );
                false
            }
        }
    }
}

impl Drop for StageWorker {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

/// Releases the single-submission claim when `submit` returns
struct InFlightClaim<'a>(&'a AtomicBool);

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)] // Tests may unwrap, panic and index
mod tests {
    use super::*;
    use crate::pipeline::aggregate::BatchAggregate;
    use crate::types::Record;

    fn config() -> PipelineConfig {
        PipelineConfig::testing()
    }

    #[test]
    fn test_worker_applies_stage() -> PipelineResult<()> {
        let mut worker = StageWorker::spawn(StageSpec::parse(), 0, &config())?;
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.name(), "parse");
        assert_eq!(worker.ordinal(), 0);

        let output = worker.submit(Batch::from_raw(0, 0, ["1", "2"]))?;
        match output {
            StageOutput::Batch(batch) => {
                let values: Vec<f64> = batch.records().iter().filter_map(Record::value).collect();
                assert_eq!(values, vec![1.0, 2.0]);
            }
            StageOutput::Aggregate(_) => panic!("parse must produce a batch"),
        }

        assert!(worker.terminate());
        Ok(())
    }

    #[test]
    fn test_worker_is_reusable_across_batches() -> PipelineResult<()> {
        let worker = StageWorker::spawn(StageSpec::aggregate(), 3, &config())?;
        for index in 0..5 {
            let batch = Batch::new(index, Vec::new());
            assert_eq!(worker.submit(batch)?, StageOutput::Aggregate(BatchAggregate::EMPTY));
        }
        Ok(())
    }

    #[test]
    fn test_worker_tags_errors_with_stage_and_batch() -> PipelineResult<()> {
        let worker = StageWorker::spawn(StageSpec::parse(), 0, &config())?;
        let error = worker.submit(Batch::from_raw(9, 0, ["oops"]));

        match error {
            Err(PipelineError::Parse {
                stage, batch_index, ..
            }) => {
                assert_eq!(stage, "parse");
                assert_eq!(batch_index, 9);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(worker.state(), WorkerState::Idle);
        Ok(())
    }

    #[test]
    fn test_worker_converts_panic() -> PipelineResult<()> {
        let stage = StageSpec::custom("panicky", |_batch| panic!("kaboom"));
        let worker = StageWorker::spawn(stage, 0, &config())?;

        match worker.submit(Batch::new(2, Vec::new())) {
            Err(PipelineError::StageTransform { reason, batch_index, .. }) => {
                assert!(reason.contains("kaboom"));
                assert_eq!(batch_index, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_submit_after_terminate_is_unavailable() -> PipelineResult<()> {
        let mut worker = StageWorker::spawn(StageSpec::filter(), 0, &config())?;
        assert!(worker.terminate());
        assert!(worker.terminate());
        assert!(worker.is_terminated());

        assert!(matches!(
            worker.submit(Batch::new(0, Vec::new())),
            Err(PipelineError::WorkerUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_concurrent_submit_is_rejected() -> PipelineResult<()> {
        let stage = StageSpec::custom("slow", |batch| {
            thread::sleep(Duration::from_millis(150));
            Ok(StageOutput::Batch(batch))
        });
        let worker = StageWorker::spawn(stage, 0, &config())?;

        for round in 0..3 {
            let barrier = std::sync::Barrier::new(2);
            let results: Vec<PipelineResult<StageOutput>> = thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|offset| {
                        let worker = &worker;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            worker.submit(Batch::new(round * 2 + offset, Vec::new()))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .collect()
            });

            let accepted = results.iter().filter(|result| result.is_ok()).count();
            let rejected = results
                .iter()
                .filter(|result| matches!(result, Err(PipelineError::WorkerUnavailable { .. })))
                .count();
            assert_eq!((accepted, rejected), (1, 1), "round {round}: {results:?}");
        }

        assert_eq!(worker.state(), WorkerState::Idle);
        Ok(())
    }

    #[test]
    fn test_stage_timeout_and_bounded_termination() -> PipelineResult<()> {
        let mut config = config();
        config.stage_timeout_ms = Some(20);
        config.drain_timeout_ms = 20;

        let stage = StageSpec::custom("slow", |batch| {
            thread::sleep(Duration::from_millis(300));
            Ok(StageOutput::Batch(batch))
        });
        let mut worker = StageWorker::spawn(stage, 0, &config)?;

        assert!(matches!(
            worker.submit(Batch::new(1, Vec::new())),
            Err(PipelineError::StageTimeout { batch_index: 1, .. })
        ));
        assert!(matches!(
            worker.submit(Batch::new(2, Vec::new())),
            Err(PipelineError::WorkerUnavailable { .. })
        ));

        let started = Instant::now();
        assert!(!worker.terminate());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(worker.is_terminated());
        Ok(())
    }
}
