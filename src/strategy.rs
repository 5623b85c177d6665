//! Scheduling policies.
//!
//! Every policy is a small trait with pure methods, selected once from the
//! configuration and shared read-only by all pools of a run.
//!
//! | Trait | Consulted by | Decides |
//! |-------|--------------|---------|
//! | [`BatchingStrategy`] | queue | which pending tests form the next batch |
//! | [`RetryStrategy`] | queue | whether a failed test is retried |
//! | [`FlakinessStrategy`] | scheduler | preventive executions per test |
//! | [`ShardingStrategy`] | scheduler | how often each test runs in a pool |
//! | [`PoolingStrategy`] | scheduler | which pool a device joins |

pub mod batching;
pub mod flakiness;
pub mod pooling;
pub mod retry;
pub mod sharding;

use std::sync::Arc;

pub use batching::{BatchingStrategy, FixedSizeBatchingStrategy, IsolateBatchingStrategy};
pub use flakiness::{FixedFlakinessStrategy, FlakinessStrategy, IgnoreFlakinessStrategy};
pub use pooling::{AttributePoolingStrategy, DeviceAttribute, OmniPoolingStrategy, PoolingStrategy};
pub use retry::{FixedQuotaRetryStrategy, NoRetryStrategy, RetryStrategy};
pub use sharding::{CountShardingStrategy, ParallelShardingStrategy, ShardingStrategy};

use crate::config::{
    BatchingConfig, FlakinessConfig, PoolingConfig, RetryConfig, ShardingConfig, StrategiesConfig,
};

/// The set of policies used by one run.
#[derive(Clone)]
pub struct Strategies {
    pub batching: Arc<dyn BatchingStrategy>,
    pub retry: Arc<dyn RetryStrategy>,
    pub flakiness: Arc<dyn FlakinessStrategy>,
    pub sharding: Arc<dyn ShardingStrategy>,
    pub pooling: Arc<dyn PoolingStrategy>,
}

impl Strategies {
    /// Instantiates the configured policies.
    pub fn from_config(config: &StrategiesConfig) -> Self {
        let batching: Arc<dyn BatchingStrategy> = match config.batching {
            BatchingConfig::Isolate => Arc::new(IsolateBatchingStrategy),
            BatchingConfig::FixedSize { size } => Arc::new(FixedSizeBatchingStrategy::new(size)),
        };
        let retry: Arc<dyn RetryStrategy> = match config.retry {
            RetryConfig::NoRetry => Arc::new(NoRetryStrategy),
            RetryConfig::FixedQuota {
                total_allowed_retry_quota,
                retry_per_test_quota,
            } => Arc::new(FixedQuotaRetryStrategy::new(
                total_allowed_retry_quota,
                retry_per_test_quota,
            )),
        };
        let flakiness: Arc<dyn FlakinessStrategy> = match config.flakiness {
            FlakinessConfig::Ignore => Arc::new(IgnoreFlakinessStrategy),
            FlakinessConfig::Fixed { attempts } => Arc::new(FixedFlakinessStrategy::new(attempts)),
        };
        let sharding: Arc<dyn ShardingStrategy> = match config.sharding {
            ShardingConfig::Parallel => Arc::new(ParallelShardingStrategy),
            ShardingConfig::Count { count } => Arc::new(CountShardingStrategy::new(count)),
        };
        let pooling: Arc<dyn PoolingStrategy> = match config.pooling {
            PoolingConfig::Omni => Arc::new(OmniPoolingStrategy),
            PoolingConfig::Model => Arc::new(AttributePoolingStrategy::new(DeviceAttribute::Model)),
            PoolingConfig::OperatingSystem => Arc::new(AttributePoolingStrategy::new(
                DeviceAttribute::OperatingSystem,
            )),
            PoolingConfig::Manufacturer => Arc::new(AttributePoolingStrategy::new(
                DeviceAttribute::Manufacturer,
            )),
            PoolingConfig::Abi => Arc::new(AttributePoolingStrategy::new(DeviceAttribute::Abi)),
        };

        Self {
            batching,
            retry,
            flakiness,
            sharding,
            pooling,
        }
    }
}

impl Default for Strategies {
    fn default() -> Self {
        Self::from_config(&StrategiesConfig::default())
    }
}
