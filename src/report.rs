//! Test reporting and output generation.
//!
//! This module turns the events of a run into something a human or a CI
//! system can read: live verdict lines on the console, the final summary
//! table, and a machine-readable `summary.json`.

pub mod summary;

pub use summary::{SummaryTracker, TestSummary};

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::analytics::Tracker;
use crate::model::{DeviceInfo, DevicePoolId, TestResult, TestStatus};
use crate::scheduler::RunResult;

/// Prints a summary of test results to the console.
///
/// Displays pass/fail counts with colored output and lists the tests
/// whose final attempt did not pass.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", result.total_tests);
    println!("  Passed:  {}", console::style(result.passed).green());
    println!("  Failed:  {}", console::style(result.failed).red());
    println!("  Ignored: {}", console::style(result.ignored).yellow());

    if result.not_run > 0 {
        println!("  Not Run: {}", console::style(result.not_run).red().bold());
    }

    if result.flaky > 0 {
        println!("  Flaky:   {}", console::style(result.flaky).yellow());
    }

    println!("  Duration: {:?}", result.duration);

    if result.success() {
        println!();
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }

    println!();
    if result.failed == 0 {
        println!(
            "{}",
            console::style("Some tests did not run before their pool stopped.")
                .red()
                .bold()
        );
        return;
    }

    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for summary in &result.results {
        if !matches!(
            summary.status,
            Some(TestStatus::Failure) | Some(TestStatus::Incomplete)
        ) {
            continue;
        }
        println!("  - [{}] {}", summary.pool, summary.test);
        if let Some(trace) = &summary.stacktrace {
            for line in trace.lines().take(5) {
                println!("    {}", console::style(line).dim());
            }
        }
    }
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    total: usize,
    passed: usize,
    failed: usize,
    ignored: usize,
    flaky: usize,
    not_run: usize,
    duration_millis: u128,
    tests: &'a [TestSummary],
}

/// Writes `summary.json` into `output_dir`, creating the directory.
pub fn write_json_summary(result: &RunResult, output_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("summary.json");
    let summary = JsonSummary {
        total: result.total_tests,
        passed: result.passed,
        failed: result.failed,
        ignored: result.ignored,
        flaky: result.flaky,
        not_run: result.not_run,
        duration_millis: result.duration.as_millis(),
        tests: &result.results,
    };
    let json = serde_json::to_string_pretty(&summary).map_err(std::io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Prints one line per final verdict.
///
/// Passing tests are only shown in verbose mode.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleTracker {
    verbose: bool,
}

impl ConsoleTracker {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Tracker for ConsoleTracker {
    fn test(&self, pool: &DevicePoolId, device: &DeviceInfo, result: &TestResult, is_final: bool) {
        if !is_final {
            return;
        }
        let status = match result.status {
            TestStatus::Passed => console::style("PASS").green(),
            TestStatus::Failure => console::style("FAIL").red(),
            TestStatus::Ignored | TestStatus::AssumptionFailure => console::style("SKIP").yellow(),
            TestStatus::Incomplete => console::style("INC ").red().bold(),
        };
        if self.verbose || result.status != TestStatus::Passed {
            println!(
                "{} [{}] {} ({})",
                status, pool, result.test, device.serial_number
            );
        }
    }
}
