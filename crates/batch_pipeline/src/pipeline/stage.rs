//! Pipeline stages
//!
//! A closed set of built-in transforms plus one `Custom` variant carrying an
//! injected pure function. Stages hold no state between invocations.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;

use crate::{
    error::StageFailure,
    pipeline::aggregate::BatchAggregate,
    types::{Batch, ParsedRecord, Record, TransformedRecord},
};

/// Records survive `filter` iff `FILTER_LOWER_BOUND < value < FILTER_UPPER_BOUND`
pub const FILTER_LOWER_BOUND: f64 = 25.0;

/// Exclusive upper bound of the filter stage
pub const FILTER_UPPER_BOUND: f64 = 75.0;

/// `normalized = value / NORMALIZATION_DIVISOR`
pub const NORMALIZATION_DIVISOR: f64 = 100.0;

/// Injected transform for [`StageKind::Custom`]
pub type CustomTransform = Arc<dyn Fn(Batch) -> anyhow::Result<StageOutput> + Send + Sync>;

/// What a stage hands to the next hop
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Derived batch for the next stage
    Batch(Batch),
    /// Terminal summary
    Aggregate(BatchAggregate),
}

impl StageOutput {
    /// Number of records in the output (aggregate count for summaries)
    #[must_use]
    pub fn record_count(&self) -> usize {
        match self {
            Self::Batch(batch) => batch.len(),
            Self::Aggregate(aggregate) => usize::try_from(aggregate.count).unwrap_or(usize::MAX),
        }
    }
}

/// Stage transform kind
#[derive(Clone)]
pub enum StageKind {
    /// Raw text to `{id, value, timestamp}`
    Parse,
    /// Adds `normalized` and `squared`
    Transform,
    /// Keeps `25 < value < 75`
    Filter,
    /// Reduces the batch to a [`BatchAggregate`]
    Aggregate,
    /// Injected pure transform
    Custom(CustomTransform),
}

impl StageKind {
    /// Kind label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Transform => "transform",
            Self::Filter => "filter",
            Self::Aggregate => "aggregate",
            Self::Custom(_) => "custom",
        }
    }

    /// Check if the kind always produces an aggregate
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Aggregate)
    }
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(_) => f.write_str("Custom(..)"),
            other => f.write_str(other.label()),
        }
    }
}

/// Named stage in the pipeline
#[derive(Debug, Clone)]
pub struct StageSpec {
    name: String,
    kind: StageKind,
}

impl StageSpec {
    /// Create stage
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Built-in parse stage named `parse`
    #[must_use]
    pub fn parse() -> Self {
        Self::new("parse", StageKind::Parse)
    }

    /// Built-in transform stage named `transform`
    #[must_use]
    pub fn transform() -> Self {
        Self::new("transform", StageKind::Transform)
    }

    /// Built-in filter stage named `filter`
    #[must_use]
    pub fn filter() -> Self {
        Self::new("filter", StageKind::Filter)
    }

    /// Built-in aggregate stage named `aggregate`
    #[must_use]
    pub fn aggregate() -> Self {
        Self::new("aggregate", StageKind::Aggregate)
    }

    /// Custom stage from a pure function
    pub fn custom<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Batch) -> anyhow::Result<StageOutput> + Send + Sync + 'static,
    {
        Self::new(name, StageKind::Custom(Arc::new(transform)))
    }

    /// Stage name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage kind
    #[must_use]
    pub const fn kind(&self) -> &StageKind {
        &self.kind
    }

    /// Apply the stage transform
    ///
    /// # Errors
    ///
    /// Returns error if a record cannot be parsed, has the wrong shape for
    /// the stage, or a custom transform fails
    pub fn apply(&self, batch: Batch) -> Result<StageOutput, StageFailure> {
        match &self.kind {
            StageKind::Parse => parse_batch(&batch).map(StageOutput::Batch),
            StageKind::Transform => transform_batch(&batch).map(StageOutput::Batch),
            StageKind::Filter => filter_batch(batch).map(StageOutput::Batch),
            StageKind::Aggregate => aggregate_batch(&batch).map(StageOutput::Aggregate),
            StageKind::Custom(transform) => {
                transform(batch).map_err(|e| StageFailure::transform(format!("{e:#}")))
            }
        }
    }
}

/// The four built-ins in pipeline order
#[must_use]
pub fn builtin_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::parse(),
        StageSpec::transform(),
        StageSpec::filter(),
        StageSpec::aggregate(),
    ]
}

/// Parse a raw value as a finite number
///
/// # Errors
///
/// Returns the reason when the trimmed text is not a finite float
pub fn parse_value(raw: &str) -> Result<f64, String> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err("value is not finite".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Check the filter stage bounds (both exclusive)
#[must_use]
pub fn within_filter_bounds(value: f64) -> bool {
    FILTER_LOWER_BOUND < value && value < FILTER_UPPER_BOUND
}

fn parse_batch(batch: &Batch) -> Result<Batch, StageFailure> {
    let timestamp = Utc::now();
    let records = batch
        .records()
        .iter()
        .map(|record| match record {
            Record::Raw(raw) => parse_value(&raw.raw)
                .map(|value| {
                    Record::Parsed(ParsedRecord {
                        id: raw.id,
                        value,
                        timestamp,
                    })
                })
                .map_err(|reason| StageFailure::parse(raw.id, raw.raw.as_str(), reason)),
            other => Err(shape_mismatch("parse", "raw", other)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Batch::new(batch.index(), records))
}

fn transform_batch(batch: &Batch) -> Result<Batch, StageFailure> {
    let records = batch
        .records()
        .iter()
        .map(|record| {
            let (id, value, timestamp) = match record {
                Record::Parsed(parsed) => (parsed.id, parsed.value, parsed.timestamp),
                Record::Transformed(transformed) => {
                    (transformed.id, transformed.value, transformed.timestamp)
                }
                Record::Raw(_) => return Err(shape_mismatch("transform", "numeric", record)),
            };
            Ok(Record::Transformed(TransformedRecord {
                id,
                value,
                timestamp,
                normalized: value / NORMALIZATION_DIVISOR,
                squared: value * value,
            }))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Batch::new(batch.index(), records))
}

fn filter_batch(batch: Batch) -> Result<Batch, StageFailure> {
    let index = batch.index();
    let mut retained = Vec::with_capacity(batch.len());

    for record in batch.into_records() {
        let Some(value) = record.value() else {
            return Err(shape_mismatch("filter", "numeric", &record));
        };
        if within_filter_bounds(value) {
            retained.push(record);
        }
    }

    Ok(Batch::new(index, retained))
}

fn aggregate_batch(batch: &Batch) -> Result<BatchAggregate, StageFailure> {
    let values = batch
        .records()
        .iter()
        .map(|record| record.value().ok_or_else(|| shape_mismatch("aggregate", "numeric", record)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BatchAggregate::from_values(&values))
}

fn shape_mismatch(stage: &str, expected: &str, record: &Record) -> StageFailure {
    StageFailure::transform(format!(
        "{stage} expects {expected} records, got {} record {}",
        record.shape(),
        record.id()
    ))
}
