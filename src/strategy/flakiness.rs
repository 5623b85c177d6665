//! Flakiness strategies.
//!
//! A flakiness strategy schedules preventive executions up front so that a
//! flaky test gets several chances in parallel with the rest of the suite
//! instead of trailing retries at the end. The queue merges the attempts:
//! the first passing attempt decides the verdict (strict runs excepted)
//! and cancels the remaining ones.

use crate::model::TestShard;

/// Adds preventive executions to a shard.
pub trait FlakinessStrategy: Send + Sync {
    fn process(&self, shard: TestShard) -> TestShard;
}

/// Leaves the shard untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreFlakinessStrategy;

impl FlakinessStrategy for IgnoreFlakinessStrategy {
    fn process(&self, shard: TestShard) -> TestShard {
        shard
    }
}

/// Schedules `attempts` extra executions for every test.
#[derive(Debug, Clone, Copy)]
pub struct FixedFlakinessStrategy {
    attempts: usize,
}

impl FixedFlakinessStrategy {
    pub fn new(attempts: usize) -> Self {
        Self { attempts }
    }
}

impl FlakinessStrategy for FixedFlakinessStrategy {
    fn process(&self, shard: TestShard) -> TestShard {
        let flaky_tests = shard
            .tests
            .iter()
            .flat_map(|t| std::iter::repeat_n(t.clone(), self.attempts))
            .collect();
        TestShard {
            tests: shard.tests,
            flaky_tests,
        }
    }
}
