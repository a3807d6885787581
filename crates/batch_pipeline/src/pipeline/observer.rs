//! Progress observer invoked after each completed batch

use crate::{pipeline::aggregate::BatchAggregate, types::BatchIndex};

/// Receives every successful batch aggregate, in input order
#[cfg_attr(test, mockall::automock)]
pub trait BatchObserver: Send {
    /// Called once per completed batch
    fn on_batch(&mut self, index: BatchIndex, aggregate: &BatchAggregate);
}

impl<F> BatchObserver for F
where
    F: FnMut(BatchIndex, &BatchAggregate) + Send,
{
    fn on_batch(&mut self, index: BatchIndex, aggregate: &BatchAggregate) {
        self(index, aggregate);
    }
}

/// Observer that ignores every batch
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {
    fn on_batch(&mut self, _index: BatchIndex, _aggregate: &BatchAggregate) {}
}
