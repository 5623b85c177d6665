//! Retry strategies for failed tests.
//!
//! The queue asks the retry strategy only for definitive failures that are
//! neither strict runs nor crashes matching an ignore pattern. The strategy
//! is stateless; the queue owns the counters and passes them in.

/// Decides whether a failed test gets another attempt.
pub trait RetryStrategy: Send + Sync {
    /// `test_retries` is how many retries this test already consumed in the
    /// pool, `total_retries` is the pool-wide count.
    fn should_retry(&self, test_retries: u32, total_retries: u32) -> bool;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryStrategy;

impl RetryStrategy for NoRetryStrategy {
    fn should_retry(&self, _test_retries: u32, _total_retries: u32) -> bool {
        false
    }
}

/// Retries each test a bounded number of times, within a pool-wide budget.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuotaRetryStrategy {
    total_allowed_retry_quota: u32,
    retry_per_test_quota: u32,
}

impl FixedQuotaRetryStrategy {
    pub fn new(total_allowed_retry_quota: u32, retry_per_test_quota: u32) -> Self {
        Self {
            total_allowed_retry_quota,
            retry_per_test_quota,
        }
    }
}

impl RetryStrategy for FixedQuotaRetryStrategy {
    fn should_retry(&self, test_retries: u32, total_retries: u32) -> bool {
        test_retries < self.retry_per_test_quota && total_retries < self.total_allowed_retry_quota
    }
}
