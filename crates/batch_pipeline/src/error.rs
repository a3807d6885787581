//! `TallyIO` Batch Pipeline Error System
//!
//! Every run-time failure is fatal to the current run and carries the stage
//! name and batch index needed to reproduce it.

use std::time::Duration;
use thiserror::Error;

use crate::types::BatchIndex;

/// Pipeline result type for all operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A raw record value could not be parsed as a number
    #[error(
        "Parse failed in stage '{stage}' for batch {batch_index}: record {record_id} value '{raw}' - {reason}"
    )]
    Parse {
        /// Stage that failed
        stage: String,
        /// Batch being processed
        batch_index: BatchIndex,
        /// Offending record identifier
        record_id: u64,
        /// Offending raw value
        raw: String,
        /// Reason for failure
        reason: String,
    },

    /// Any other stage-level failure
    #[error("Stage '{stage}' failed for batch {batch_index}: {reason}")]
    StageTransform {
        /// Stage that failed
        stage: String,
        /// Batch being processed
        batch_index: BatchIndex,
        /// Reason for failure
        reason: String,
    },

    /// Worker failed to start or was already terminated
    #[error("Worker for stage '{stage}' is unavailable: {reason}")]
    WorkerUnavailable {
        /// Stage bound to the worker
        stage: String,
        /// Reason the worker is unavailable
        reason: String,
    },

    /// Worker did not reply within the configured stage timeout
    #[error("Stage '{stage}' timed out after {timeout:?} on batch {batch_index}")]
    StageTimeout {
        /// Stage that timed out
        stage: String,
        /// Batch being processed
        batch_index: BatchIndex,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Invalid configuration or stage list
    #[error("Configuration error: {field} - {reason}")]
    Configuration {
        /// Offending field
        field: String,
        /// Reason for failure
        reason: String,
    },

    /// Layered configuration loading errors
    #[error("Configuration loading failed: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// TOML configuration errors
    #[error("TOML configuration error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    /// Create stage transform error
    pub fn stage_transform(
        stage: impl Into<String>,
        batch_index: BatchIndex,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageTransform {
            stage: stage.into(),
            batch_index,
            reason: reason.into(),
        }
    }

    /// Create worker unavailable error
    pub fn worker_unavailable(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create stage timeout error
    pub fn stage_timeout(stage: impl Into<String>, batch_index: BatchIndex, timeout: Duration) -> Self {
        Self::StageTimeout {
            stage: stage.into(),
            batch_index,
            timeout,
        }
    }

    /// Create configuration error
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the stage the error is attributed to, if any
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::Parse { stage, .. }
            | Self::StageTransform { stage, .. }
            | Self::WorkerUnavailable { stage, .. }
            | Self::StageTimeout { stage, .. } => Some(stage),
            Self::Configuration { .. } | Self::ConfigLoad(_) | Self::Toml(_) => None,
        }
    }

    /// Index of the batch that was being processed, if any
    #[must_use]
    pub const fn batch_index(&self) -> Option<BatchIndex> {
        match self {
            Self::Parse { batch_index, .. }
            | Self::StageTransform { batch_index, .. }
            | Self::StageTimeout { batch_index, .. } => Some(*batch_index),
            Self::WorkerUnavailable { .. }
            | Self::Configuration { .. }
            | Self::ConfigLoad(_)
            | Self::Toml(_) => None,
        }
    }

    /// Check if re-running the same batches could succeed
    ///
    /// Stages are pure and batches immutable, so parse and transform
    /// failures reproduce on every attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::WorkerUnavailable { .. } | Self::StageTimeout { .. } => true,
            Self::Parse { .. }
            | Self::StageTransform { .. }
            | Self::Configuration { .. }
            | Self::ConfigLoad(_)
            | Self::Toml(_) => false,
        }
    }
}

/// Failure raised inside a stage transform, before the worker tags it
/// with the stage name and batch index
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// Raw value is not numeric
    #[error("record {record_id} value '{raw}' is not numeric: {reason}")]
    Parse {
        /// Offending record identifier
        record_id: u64,
        /// Offending raw value
        raw: String,
        /// Reason for failure
        reason: String,
    },

    /// Any other transform failure
    #[error("{reason}")]
    Transform {
        /// Reason for failure
        reason: String,
    },
}

impl StageFailure {
    /// Create parse failure
    pub fn parse(record_id: u64, raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            record_id,
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Create transform failure
    pub fn transform(reason: impl Into<String>) -> Self {
        Self::Transform {
            reason: reason.into(),
        }
    }

    /// Attach stage and batch context
    #[must_use]
    pub fn into_pipeline_error(self, stage: &str, batch_index: BatchIndex) -> PipelineError {
        match self {
            Self::Parse {
                record_id,
                raw,
                reason,
            } => PipelineError::Parse {
                stage: stage.to_string(),
                batch_index,
                record_id,
                raw,
                reason,
            },
            Self::Transform { reason } => PipelineError::stage_transform(stage, batch_index, reason),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)] // Tests may unwrap, panic and index
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_carries_context() {
        let error = StageFailure::parse(7, "abc", "invalid float literal").into_pipeline_error("parse", 3);

        assert_eq!(error.stage_name(), Some("parse"));
        assert_eq!(error.batch_index(), Some(3));
        assert!(!error.is_retryable());
        match error {
            PipelineError::Parse { record_id, raw, .. } => {
                assert_eq!(record_id, 7);
                assert_eq!(raw, "abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(PipelineError::worker_unavailable("filter", "terminated").is_retryable());
        assert!(
            PipelineError::stage_timeout("filter", 0, Duration::from_millis(5)).is_retryable()
        );
        assert!(!PipelineError::configuration("stages", "empty").is_retryable());
    }

    #[test]
    fn test_error_display_names_stage_and_batch() {
        let error = PipelineError::stage_transform("custom", 4, "boom");
        let message = error.to_string();
        assert!(message.contains("custom"));
        assert!(message.contains('4'));
        assert!(message.contains("boom"));
    }
}
