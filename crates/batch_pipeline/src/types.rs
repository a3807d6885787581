//! `TallyIO` Batch Pipeline Types
//!
//! Records change shape as they move through the stages
//! (raw text, parsed number, derived fields). Stages never mutate a record;
//! they build new records from the previous ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position of a batch in the input sequence
pub type BatchIndex = usize;

/// Unique identifier of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create new random run ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Record as produced by the batch source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Record identifier
    pub id: u64,
    /// Unparsed textual value
    pub raw: String,
}

/// Record after the parse stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    /// Record identifier
    pub id: u64,
    /// Numeric value
    pub value: f64,
    /// Time the record was parsed
    pub timestamp: DateTime<Utc>,
}

/// Record after the transform stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    /// Record identifier
    pub id: u64,
    /// Numeric value
    pub value: f64,
    /// Time the record was parsed
    pub timestamp: DateTime<Utc>,
    /// `value / 100`
    pub normalized: f64,
    /// `value * value`
    pub squared: f64,
}

/// A record in any of its pipeline shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Record {
    /// Unparsed source record
    Raw(RawRecord),
    /// Parsed numeric record
    Parsed(ParsedRecord),
    /// Record with derived fields
    Transformed(TransformedRecord),
}

impl Record {
    /// Create a raw record
    pub fn raw(id: u64, raw: impl Into<String>) -> Self {
        Self::Raw(RawRecord {
            id,
            raw: raw.into(),
        })
    }

    /// Record identifier
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Raw(record) => record.id,
            Self::Parsed(record) => record.id,
            Self::Transformed(record) => record.id,
        }
    }

    /// Numeric value, `None` until the record has been parsed
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        match self {
            Self::Raw(_) => None,
            Self::Parsed(record) => Some(record.value),
            Self::Transformed(record) => Some(record.value),
        }
    }

    /// Shape name used in error messages
    #[must_use]
    pub const fn shape(&self) -> &'static str {
        match self {
            Self::Raw(_) => "raw",
            Self::Parsed(_) => "parsed",
            Self::Transformed(_) => "transformed",
        }
    }
}

/// Ordered group of records processed as one unit
///
/// Fields are private: a batch is immutable once the source creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    index: BatchIndex,
    records: Vec<Record>,
}

impl Batch {
    /// Create a batch from records
    #[must_use]
    pub const fn new(index: BatchIndex, records: Vec<Record>) -> Self {
        Self { index, records }
    }

    /// Create a batch of raw records with ids starting at `first_id`
    pub fn from_raw<I, S>(index: BatchIndex, first_id: u64, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = values
            .into_iter()
            .zip(first_id..)
            .map(|(raw, id)| Record::raw(id, raw))
            .collect();
        Self::new(index, records)
    }

    /// Split raw values into consecutive batches of `batch_size` records
    ///
    /// Record ids increase across batches. The last batch may be shorter.
    /// A `batch_size` of zero is treated as one.
    pub fn chunk_raw<I, S>(values: I, batch_size: usize) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(batch_size);

        for (id, raw) in (0_u64..).zip(values) {
            current.push(Record::raw(id, raw));
            if current.len() == batch_size {
                let records = std::mem::replace(&mut current, Vec::with_capacity(batch_size));
                batches.push(Self::new(batches.len(), records));
            }
        }

        if !current.is_empty() {
            batches.push(Self::new(batches.len(), current));
        }

        batches
    }

    /// Batch index tag
    #[must_use]
    pub const fn index(&self) -> BatchIndex {
        self.index
    }

    /// Records in order
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if batch has no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume the batch, yielding its records
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)] // Tests may unwrap, panic and index
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_assigns_sequential_ids() {
        let batch = Batch::from_raw(2, 10, ["1", "2", "3"]);

        assert_eq!(batch.index(), 2);
        assert_eq!(batch.len(), 3);
        let ids: Vec<u64> = batch.records().iter().map(Record::id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(batch.records().iter().all(|r| r.value().is_none()));
    }

    #[test]
    fn test_chunk_raw_keeps_size_and_order() {
        let values: Vec<String> = (0..250).map(|i| i.to_string()).collect();
        let batches = Batch::chunk_raw(values, 100);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 100);
        assert_eq!(batches[2].len(), 50);
        for (position, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index(), position);
        }
        assert_eq!(batches[1].records()[0].id(), 100);
        assert_eq!(batches[2].records()[49].id(), 249);
    }

    #[test]
    fn test_chunk_raw_empty_input() {
        let batches = Batch::chunk_raw(Vec::<String>::new(), 100);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_chunk_raw_zero_size_is_one() {
        let batches = Batch::chunk_raw(["a", "b"], 0);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_record_serializes_with_shape_tag() -> Result<(), serde_json::Error> {
        let json = serde_json::to_value(Record::raw(1, "42"))?;
        assert_eq!(json["shape"], "raw");
        assert_eq!(json["raw"], "42");
        Ok(())
    }

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        assert!(id.to_string().starts_with("run-"));
        assert_ne!(id, RunId::new());
    }
}
