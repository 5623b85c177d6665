//! Per-test execution summary collected from `test` events.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::analytics::Tracker;
use crate::model::{DeviceInfo, DevicePoolId, Test, TestResult, TestStatus};

/// Everything known about one test in one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub pool: DevicePoolId,
    pub test: Test,
    /// Status of the final attempt, `None` while the test has no verdict.
    pub status: Option<TestStatus>,
    /// Device of the final attempt.
    pub device: Option<String>,
    pub attempts: usize,
    pub failed_attempts: usize,
    pub stacktrace: Option<String>,
    pub duration_millis: i64,
}

impl TestSummary {
    fn new(pool: DevicePoolId, test: Test) -> Self {
        Self {
            pool,
            test,
            status: None,
            device: None,
            attempts: 0,
            failed_attempts: 0,
            stacktrace: None,
            duration_millis: 0,
        }
    }

    /// A test is flaky when it passed in the end but failed along the way.
    pub fn is_flaky(&self) -> bool {
        self.status == Some(TestStatus::Passed) && self.failed_attempts > 0
    }

    pub fn is_final(&self) -> bool {
        self.status.is_some()
    }
}

/// Tracker that folds every attempt into a [`TestSummary`].
///
/// ```
/// use fleetrun::analytics::Tracker;
/// use fleetrun::model::*;
/// use fleetrun::report::SummaryTracker;
///
/// let tracker = SummaryTracker::new();
/// let pool = DevicePoolId::new("omni");
/// let device = DeviceInfo::new("local-0");
/// let test = Test::new("com.example", "LoginTest", "valid", ComponentInfo::default());
///
/// let failed = TestResult::new(test.clone(), device.clone(), TestStatus::Failure, "b1");
/// let passed = TestResult::new(test, device.clone(), TestStatus::Passed, "b2");
/// tracker.test(&pool, &device, &failed, false);
/// tracker.test(&pool, &device, &passed, true);
///
/// let summaries = tracker.summaries();
/// assert_eq!(summaries.len(), 1);
/// assert!(summaries[0].is_flaky());
/// ```
#[derive(Debug, Default)]
pub struct SummaryTracker {
    tests: Mutex<HashMap<(DevicePoolId, Test), TestSummary>>,
}

impl SummaryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all summaries, ordered by pool and test name.
    pub fn summaries(&self) -> Vec<TestSummary> {
        let tests = self.tests.lock().unwrap_or_else(|p| p.into_inner());
        let mut summaries: Vec<TestSummary> = tests.values().cloned().collect();
        summaries.sort_by(|a, b| {
            (&a.pool, a.test.to_string()).cmp(&(&b.pool, b.test.to_string()))
        });
        summaries
    }
}

impl Tracker for SummaryTracker {
    fn test(&self, pool: &DevicePoolId, device: &DeviceInfo, result: &TestResult, is_final: bool) {
        let mut tests = self.tests.lock().unwrap_or_else(|p| p.into_inner());
        let summary = tests
            .entry((pool.clone(), result.test.clone()))
            .or_insert_with(|| TestSummary::new(pool.clone(), result.test.clone()));

        summary.attempts += 1;
        if matches!(result.status, TestStatus::Failure | TestStatus::Incomplete) {
            summary.failed_attempts += 1;
        }
        if is_final {
            summary.status = Some(result.status);
            summary.device = Some(device.serial_number.clone());
            summary.stacktrace = result.stacktrace.clone();
            summary.duration_millis = result.duration().num_milliseconds();
        }
    }
}
