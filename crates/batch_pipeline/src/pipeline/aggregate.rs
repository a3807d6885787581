//! Batch and global aggregates
//!
//! A zero-count batch carries `+inf`/`-inf` min/max sentinels. The
//! [`ResultAggregator`] skips those batches when reducing the global bounds.

use serde::{Deserialize, Serialize};

/// Numeric summary of one batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchAggregate {
    /// Surviving record count
    pub count: u64,
    /// Sum of values
    pub sum: f64,
    /// `sum / count`, or 0 when empty
    pub avg: f64,
    /// Smallest value, `+inf` when empty
    #[serde(with = "min_sentinel")]
    pub min: f64,
    /// Largest value, `-inf` when empty
    #[serde(with = "max_sentinel")]
    pub max: f64,
}

impl BatchAggregate {
    /// Aggregate over no records
    pub const EMPTY: Self = Self {
        count: 0,
        sum: 0.0,
        avg: 0.0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    /// Reduce values to an aggregate
    #[must_use]
    pub fn from_values(values: &[f64]) -> Self {
        let (count, sum, min, max) = values.iter().fold(
            (0_u64, 0.0_f64, f64::INFINITY, f64::NEG_INFINITY),
            |(count, sum, min, max), &value| (count + 1, sum + value, min.min(value), max.max(value)),
        );

        Self {
            count,
            sum,
            avg: average(sum, count),
            min,
            max,
        }
    }

    /// Check if no records survived
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `(min, max)` for a non-empty batch
    #[must_use]
    pub fn bounds(&self) -> Option<(f64, f64)> {
        (!self.is_empty()).then_some((self.min, self.max))
    }
}

impl Default for BatchAggregate {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Cross-batch combination of [`BatchAggregate`]s
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    /// Total record count
    pub count: u64,
    /// Total sum
    pub sum: f64,
    /// `sum / count`, or 0 when empty
    pub avg: f64,
    /// Smallest value over non-empty batches
    pub min: Option<f64>,
    /// Largest value over non-empty batches
    pub max: Option<f64>,
    /// Number of batches combined, including empty ones
    pub batch_count: usize,
}

impl Default for GlobalAggregate {
    fn default() -> Self {
        ResultAggregator::new().finish()
    }
}

/// Running fold of batch aggregates into a [`GlobalAggregate`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    batch_count: usize,
}

impl ResultAggregator {
    /// Create empty aggregator
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
            batch_count: 0,
        }
    }

    /// Fold one batch aggregate
    pub fn push(&mut self, aggregate: &BatchAggregate) {
        self.batch_count += 1;
        self.count += aggregate.count;
        self.sum += aggregate.sum;

        if let Some((min, max)) = aggregate.bounds() {
            self.min = Some(self.min.map_or(min, |current| current.min(min)));
            self.max = Some(self.max.map_or(max, |current| current.max(max)));
        }
    }

    /// Current global aggregate
    #[must_use]
    pub fn finish(&self) -> GlobalAggregate {
        GlobalAggregate {
            count: self.count,
            sum: self.sum,
            avg: average(self.sum, self.count),
            min: self.min,
            max: self.max,
            batch_count: self.batch_count,
        }
    }

    /// Combine an ordered sequence of batch aggregates
    pub fn combine<'a, I>(aggregates: I) -> GlobalAggregate
    where
        I: IntoIterator<Item = &'a BatchAggregate>,
    {
        let mut aggregator = Self::new();
        for aggregate in aggregates {
            aggregator.push(aggregate);
        }
        aggregator.finish()
    }
}

fn average(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// `+inf` serializes as `null`
mod min_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// `-inf` serializes as `null`
mod max_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)] // Tests may unwrap, panic and index
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn batch(count: u64, sum: f64, min: f64, max: f64) -> BatchAggregate {
        BatchAggregate {
            count,
            sum,
            avg: sum / count as f64,
            min,
            max,
        }
    }

    #[test]
    fn test_from_values() {
        let aggregate = BatchAggregate::from_values(&[30.0, 50.0, 70.0]);
        assert_eq!(aggregate.count, 3);
        assert!((aggregate.sum - 150.0).abs() < f64::EPSILON);
        assert!((aggregate.avg - 50.0).abs() < f64::EPSILON);
        assert_eq!(aggregate.bounds(), Some((30.0, 70.0)));
    }

    #[test]
    fn test_empty_values_yield_sentinels() {
        let aggregate = BatchAggregate::from_values(&[]);
        assert_eq!(aggregate, BatchAggregate::EMPTY);
        assert!(aggregate.is_empty());
        assert!(aggregate.bounds().is_none());
        assert_eq!(aggregate.min, f64::INFINITY);
        assert_eq!(aggregate.max, f64::NEG_INFINITY);
    }

    #[test]
    fn test_two_batches_combine() {
        let global = ResultAggregator::combine(&[
            batch(3, 150.0, 30.0, 70.0),
            batch(2, 60.0, 20.0, 40.0),
        ]);

        assert_eq!(global.count, 5);
        assert!((global.sum - 210.0).abs() < f64::EPSILON);
        assert!((global.avg - 42.0).abs() < f64::EPSILON);
        assert_eq!(global.min, Some(20.0));
        assert_eq!(global.max, Some(70.0));
        assert_eq!(global.batch_count, 2);
    }

    #[test]
    fn test_zero_batches() {
        let global = ResultAggregator::combine(&[]);
        assert_eq!(global.count, 0);
        assert_eq!(global.sum, 0.0);
        assert_eq!(global.avg, 0.0);
        assert!(global.min.is_none());
        assert!(global.max.is_none());
        assert_eq!(global, GlobalAggregate::default());
    }

    #[test]
    fn test_empty_batch_does_not_corrupt_bounds() {
        let global = ResultAggregator::combine(&[
            BatchAggregate::EMPTY,
            batch(2, 60.0, 20.0, 40.0),
            BatchAggregate::EMPTY,
        ]);

        assert_eq!(global.count, 2);
        assert_eq!(global.min, Some(20.0));
        assert_eq!(global.max, Some(40.0));
        assert_eq!(global.batch_count, 3);
    }

    #[test]
    fn test_only_empty_batches() {
        let global = ResultAggregator::combine(&[BatchAggregate::EMPTY, BatchAggregate::EMPTY]);
        assert_eq!(global.count, 0);
        assert_eq!(global.avg, 0.0);
        assert!(global.min.is_none());
        assert!(global.max.is_none());
    }

    #[test]
    fn test_empty_aggregate_serializes_bounds_as_null() -> Result<(), serde_json::Error> {
        let json = serde_json::to_value(BatchAggregate::EMPTY)?;
        assert!(json["min"].is_null());
        assert!(json["max"].is_null());

        let back: BatchAggregate = serde_json::from_value(json)?;
        assert_eq!(back, BatchAggregate::EMPTY);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_aggregate_consistency(values in prop::collection::vec(-1_000.0_f64..1_000.0, 0..64)) {
            let aggregate = BatchAggregate::from_values(&values);
            let sum: f64 = values.iter().sum();

            prop_assert_eq!(aggregate.count, values.len() as u64);
            prop_assert!((aggregate.sum - sum).abs() < 1e-6);
            if values.is_empty() {
                prop_assert_eq!(aggregate.avg, 0.0);
            } else {
                prop_assert!((aggregate.avg - aggregate.sum / values.len() as f64).abs() < 1e-9);
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                prop_assert_eq!(aggregate.bounds(), Some((min, max)));
            }
        }

        #[test]
        fn prop_global_combination(
            batches in prop::collection::vec(prop::collection::vec(0.0_f64..100.0, 0..16), 0..16)
        ) {
            let aggregates: Vec<BatchAggregate> =
                batches.iter().map(|values| BatchAggregate::from_values(values)).collect();
            let global = ResultAggregator::combine(&aggregates);

            let count: u64 = aggregates.iter().map(|a| a.count).sum();
            let sum: f64 = aggregates.iter().map(|a| a.sum).sum();
            let min = aggregates.iter().filter_map(BatchAggregate::bounds).map(|(min, _)| min).reduce(f64::min);
            let max = aggregates.iter().filter_map(BatchAggregate::bounds).map(|(_, max)| max).reduce(f64::max);

            prop_assert_eq!(global.count, count);
            prop_assert!((global.sum - sum).abs() < 1e-6);
            if count == 0 {
                prop_assert_eq!(global.avg, 0.0);
            } else {
                prop_assert!((global.avg - sum / count as f64).abs() < 1e-6);
            }
            prop_assert_eq!(global.min, min);
            prop_assert_eq!(global.max, max);
            prop_assert!(global.min.map_or(true, f64::is_finite));
            prop_assert!(global.max.map_or(true, f64::is_finite));
        }
    }
}
