//! Sharding strategies: how the suite becomes the shard of each pool.

use crate::model::{Test, TestShard};

/// Builds the shard handed to every pool.
pub trait ShardingStrategy: Send + Sync {
    fn create_shard(&self, tests: Vec<Test>) -> TestShard;
}

/// Runs every test once per pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelShardingStrategy;

impl ShardingStrategy for ParallelShardingStrategy {
    fn create_shard(&self, tests: Vec<Test>) -> TestShard {
        TestShard::new(tests)
    }
}

/// Runs every test `count` times per pool, e.g. to measure stability.
#[derive(Debug, Clone, Copy)]
pub struct CountShardingStrategy {
    count: usize,
}

impl CountShardingStrategy {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }
}

impl ShardingStrategy for CountShardingStrategy {
    fn create_shard(&self, tests: Vec<Test>) -> TestShard {
        let tests = tests
            .into_iter()
            .flat_map(|t| std::iter::repeat_n(t, self.count))
            .collect();
        TestShard::new(tests)
    }
}
