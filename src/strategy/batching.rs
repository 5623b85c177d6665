//! Batching strategies.
//!
//! A batching strategy picks the tests of the next batch out of the
//! tests the queue can currently dispatch. It never sees tests that are
//! already running somewhere, and it receives every test at most once.
//!
//! | Strategy | Description | Use Case |
//! |----------|-------------|----------|
//! | [`IsolateBatchingStrategy`] | One test per batch | Maximum isolation, best load balance |
//! | [`FixedSizeBatchingStrategy`] | Up to `size` tests of one component | Amortise per-batch setup cost |
//!
//! # Example
//!
//! ```
//! use fleetrun::model::{ComponentInfo, Test};
//! use fleetrun::strategy::{BatchingStrategy, FixedSizeBatchingStrategy};
//!
//! let strategy = FixedSizeBatchingStrategy::new(2);
//! let tests: Vec<Test> = (0..5)
//!     .map(|i| Test::new("com.example", "Suite", format!("test{}", i), ComponentInfo::default()))
//!     .collect();
//!
//! let batch = strategy.next_batch(&tests);
//! assert_eq!(batch.len(), 2);
//! ```

use crate::model::Test;

/// Carves the next batch out of dispatchable tests.
pub trait BatchingStrategy: Send + Sync {
    /// Returns the tests of the next batch, in execution order.
    ///
    /// `candidates` are distinct tests in queue order. The returned tests
    /// must be a subset of `candidates` sharing one component, and must be
    /// non-empty whenever `candidates` is non-empty.
    fn next_batch(&self, candidates: &[Test]) -> Vec<Test>;
}

/// Dispatches one test per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolateBatchingStrategy;

impl BatchingStrategy for IsolateBatchingStrategy {
    fn next_batch(&self, candidates: &[Test]) -> Vec<Test> {
        candidates.first().cloned().into_iter().collect()
    }
}

/// Dispatches up to `size` tests belonging to the component of the first
/// candidate.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeBatchingStrategy {
    size: usize,
}

impl FixedSizeBatchingStrategy {
    /// Creates a strategy with the given maximum batch size.
    ///
    /// Sizes below 1 are clamped to 1.
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl BatchingStrategy for FixedSizeBatchingStrategy {
    fn next_batch(&self, candidates: &[Test]) -> Vec<Test> {
        let Some(first) = candidates.first() else {
            return Vec::new();
        };

        candidates
            .iter()
            .filter(|t| t.component == first.component)
            .take(self.size)
            .cloned()
            .collect()
    }
}
