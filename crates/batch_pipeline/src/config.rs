//! `TallyIO` Batch Pipeline Configuration
//!
//! Configuration with `garde` validation, loadable from TOML or from a
//! layered file + environment source.

use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Environment variable prefix for layered loading
pub const ENV_PREFIX: &str = "TALLYIO_PIPELINE";

/// Pipeline run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Records per batch when chunking a source
    #[garde(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,

    /// Capacity of each worker mailbox
    #[garde(range(min = 1, max = 1024))]
    pub mailbox_capacity: usize,

    /// Grace period for a worker to exit on termination (milliseconds)
    #[garde(range(min = 1, max = 60_000))]
    pub drain_timeout_ms: u64,

    /// Deadline for a single stage submission (milliseconds, none = wait)
    #[garde(range(min = 1, max = 3_600_000))]
    pub stage_timeout_ms: Option<u64>,

    /// Worker thread name prefix
    #[garde(length(min = 1, max = 64))]
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            mailbox_capacity: 1,
            drain_timeout_ms: 100,
            stage_timeout_ms: None,
            thread_name_prefix: "tallyio-stage".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Short timeouts for tests
    #[must_use]
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            drain_timeout_ms: 50,
            stage_timeout_ms: Some(5_000),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation
    pub fn from_toml_str(document: &str) -> PipelineResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate_config()?;
        Ok(config)
    }

    /// Load from an optional file, then `TALLYIO_PIPELINE__*` environment variables
    ///
    /// Missing keys fall back to [`PipelineConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be read or the result fails validation
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate_config()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any field is out of range
    pub fn validate_config(&self) -> PipelineResult<()> {
        self.validate(&())
            .map_err(|e| PipelineError::configuration("pipeline_config", format!("Validation failed: {e}")))
    }

    /// Worker drain grace period
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Per-submission deadline
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}
