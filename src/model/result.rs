//! Outcomes of test executions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::batch::TestBatch;
use super::device::DeviceInfo;
use super::test::{ComponentInfo, Test};

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failure,
    Ignored,
    /// The attempt produced no verdict (device died, batch timed out).
    Incomplete,
    AssumptionFailure,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failure => "FAILURE",
            TestStatus::Ignored => "IGNORED",
            TestStatus::Incomplete => "INCOMPLETE",
            TestStatus::AssumptionFailure => "ASSUMPTION_FAILURE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Screenshot,
    Video,
    Log,
}

/// A file produced while a test ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub kind: AttachmentType,
}

/// Outcome of one execution attempt of one test on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: Test,
    pub device: DeviceInfo,
    pub status: TestStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub batch_id: String,
    #[serde(default)]
    pub is_strict_run: bool,
    #[serde(default)]
    pub is_from_cache: bool,
    pub stacktrace: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TestResult {
    /// Creates a result with zero duration at the current time.
    pub fn new(test: Test, device: DeviceInfo, status: TestStatus, batch_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            test,
            device,
            status,
            start_time: now,
            end_time: now,
            batch_id: batch_id.into(),
            is_strict_run: false,
            is_from_cache: false,
            stacktrace: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_times(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Returns a copy with a different status.
    pub fn with_status(&self, status: TestStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Returns a copy marked as a strict run.
    pub fn with_strict_run(&self, is_strict_run: bool) -> Self {
        Self {
            is_strict_run,
            ..self.clone()
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub fn is_ignored(&self) -> bool {
        matches!(
            self.status,
            TestStatus::Ignored | TestStatus::AssumptionFailure
        )
    }
}

/// The outcome of one batch, split three ways.
///
/// Every test of the originating batch appears in exactly one of
/// `finished`, `failed` and `uncompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBatchResults {
    pub batch_id: String,
    pub device: DeviceInfo,
    pub component: ComponentInfo,
    /// Passed, ignored, or assumption failures.
    pub finished: Vec<TestResult>,
    /// Definitive failures.
    pub failed: Vec<TestResult>,
    /// Attempts that produced no verdict.
    pub uncompleted: Vec<TestResult>,
}

impl TestBatchResults {
    /// Splits raw device results into the three outcome lists.
    ///
    /// Only the first result per batch test is used. Tests the device
    /// never reported are synthesised as [`TestStatus::Incomplete`];
    /// results for tests outside the batch are dropped.
    pub fn partition(batch: &TestBatch, device: &DeviceInfo, results: Vec<TestResult>) -> Self {
        let mut remaining = results;
        let mut finished = Vec::new();
        let mut failed = Vec::new();
        let mut uncompleted = Vec::new();

        for test in &batch.tests {
            let result = match remaining.iter().position(|r| &r.test == test) {
                Some(idx) => remaining.swap_remove(idx),
                None => TestResult::new(test.clone(), device.clone(), TestStatus::Incomplete, &batch.id)
                    .with_stacktrace("Test was not reported by the device"),
            };
            match result.status {
                TestStatus::Passed | TestStatus::Ignored | TestStatus::AssumptionFailure => {
                    finished.push(result)
                }
                TestStatus::Failure => failed.push(result),
                TestStatus::Incomplete => uncompleted.push(result),
            }
        }

        // Duplicates of already-classified tests are expected (reruns inside
        // one instrumentation run); anything else is a transport bug.
        for stray in remaining.iter().filter(|r| !batch.contains(&r.test)) {
            warn!(
                "Dropping result for {} which is not part of batch {}",
                stray.test, batch.id
            );
        }

        Self {
            batch_id: batch.id.clone(),
            device: device.clone(),
            component: batch.component.clone(),
            finished,
            failed,
            uncompleted,
        }
    }

    /// Marks every test of the batch as uncompleted.
    ///
    /// Used when the device is lost or the batch times out.
    pub fn all_uncompleted(batch: &TestBatch, device: &DeviceInfo, reason: &str) -> Self {
        let uncompleted = batch
            .tests
            .iter()
            .map(|t| {
                TestResult::new(t.clone(), device.clone(), TestStatus::Incomplete, &batch.id)
                    .with_stacktrace(reason)
            })
            .collect();
        Self {
            batch_id: batch.id.clone(),
            device: device.clone(),
            component: batch.component.clone(),
            finished: Vec::new(),
            failed: Vec::new(),
            uncompleted,
        }
    }

    /// Total number of results across all three lists.
    pub fn len(&self) -> usize {
        self.finished.len() + self.failed.len() + self.uncompleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
