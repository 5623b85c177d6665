//! Run progress accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::model::{DeviceInfo, DevicePoolId, Test};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PoolProgress {
    expected: usize,
    completed: usize,
}

impl PoolProgress {
    fn ratio(&self) -> f64 {
        ratio(self.completed, self.expected)
    }
}

fn ratio(completed: usize, expected: usize) -> f64 {
    if expected == 0 {
        0.0
    } else {
        (completed as f64 / expected as f64).min(1.0)
    }
}

/// Counts expected and completed executions per pool.
///
/// `expected` grows when retries are scheduled and shrinks when scheduled
/// executions are cancelled; `completed` only ever grows. All methods are
/// safe to call concurrently from every pool of a run.
///
/// # Example
///
/// ```
/// use fleetrun::execution::ProgressReporter;
/// use fleetrun::model::{ComponentInfo, DeviceInfo, DevicePoolId, Test};
///
/// let reporter = ProgressReporter::new();
/// let pool = DevicePoolId::new("omni");
/// let device = DeviceInfo::new("emulator-5554");
/// let test = Test::new("com.example", "Suite", "a", ComponentInfo::default());
///
/// reporter.total_tests(&pool, 2);
/// reporter.test_started(&pool, &device, &test);
/// reporter.test_passed(&pool, &device, &test);
/// assert_eq!(reporter.progress(), 0.5);
/// ```
#[derive(Debug, Default)]
pub struct ProgressReporter {
    pools: Mutex<HashMap<DevicePoolId, PoolProgress>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, pool: &DevicePoolId, f: impl FnOnce(&mut PoolProgress)) {
        let mut pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        f(pools.entry(pool.clone()).or_default());
    }

    /// Sets the number of expected executions of a pool.
    pub fn total_tests(&self, pool: &DevicePoolId, count: usize) {
        self.update(pool, |p| p.expected = count);
    }

    /// Adds expected executions (retries, late shards).
    pub fn add_tests(&self, pool: &DevicePoolId, count: usize) {
        self.update(pool, |p| p.expected += count);
    }

    /// Removes expected executions that will no longer run.
    pub fn remove_tests(&self, pool: &DevicePoolId, count: usize) {
        self.update(pool, |p| p.expected = p.expected.saturating_sub(count));
    }

    pub fn test_started(&self, pool: &DevicePoolId, device: &DeviceInfo, test: &Test) {
        debug!("[{}] {} started {}", pool, device.serial_number, test);
    }

    pub fn test_passed(&self, pool: &DevicePoolId, device: &DeviceInfo, test: &Test) {
        self.complete(pool, device, test, "passed");
    }

    pub fn test_failed(&self, pool: &DevicePoolId, device: &DeviceInfo, test: &Test) {
        self.complete(pool, device, test, "failed");
    }

    pub fn test_ignored(&self, pool: &DevicePoolId, device: &DeviceInfo, test: &Test) {
        self.complete(pool, device, test, "ignored");
    }

    fn complete(&self, pool: &DevicePoolId, device: &DeviceInfo, test: &Test, outcome: &str) {
        let mut progress = 0.0;
        self.update(pool, |p| {
            p.completed += 1;
            progress = p.ratio();
        });
        debug!(
            "[{}] {} {} {} ({:.0}%)",
            pool,
            device.serial_number,
            outcome,
            test,
            progress * 100.0
        );
    }

    /// Completed over expected executions across all pools, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        let (completed, expected) = pools
            .values()
            .fold((0, 0), |(c, e), p| (c + p.completed, e + p.expected));
        ratio(completed, expected)
    }

    /// Progress of a single pool, `0` for unknown pools.
    pub fn pool_progress(&self, pool: &DevicePoolId) -> f64 {
        let pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        pools.get(pool).map(PoolProgress::ratio).unwrap_or(0.0)
    }

    /// Completed executions of a pool.
    pub fn completed(&self, pool: &DevicePoolId) -> usize {
        let pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        pools.get(pool).map(|p| p.completed).unwrap_or(0)
    }

    /// Expected executions of a pool.
    pub fn expected(&self, pool: &DevicePoolId) -> usize {
        let pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        pools.get(pool).map(|p| p.expected).unwrap_or(0)
    }
}
