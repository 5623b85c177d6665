//! Batch logs used to classify crashes.
//!
//! A [`LogsProvider`] exposes what the device transport captured while a
//! batch ran (e.g. a system log). The queue only cares about crash events:
//! a failure whose crash message matches an ignore-crash pattern is treated
//! as an infrastructure problem rather than a test failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::model::Test;

/// Test key inside a batch log; component-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogTest {
    pub package: String,
    pub class: String,
    pub method: String,
}

impl From<&Test> for LogTest {
    fn from(test: &Test) -> Self {
        Self {
            package: test.package.clone(),
            class: test.class.clone(),
            method: test.method.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Crash { message: String },
}

#[derive(Debug, Clone, Default)]
pub struct Log {
    pub file: Option<PathBuf>,
    pub events: Vec<LogEvent>,
}

impl Log {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self { file: None, events }
    }

    /// Messages of all crash events in this log.
    pub fn crash_messages(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| match e {
            LogEvent::Crash { message } => message.as_str(),
        })
    }
}

/// Logs captured during one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchLogs {
    pub tests: HashMap<LogTest, Log>,
    pub log: Log,
}

impl BatchLogs {
    pub fn for_test(&self, test: &Test) -> Option<&Log> {
        self.tests.get(&LogTest::from(test))
    }
}

/// Source of batch logs.
#[async_trait]
pub trait LogsProvider: Send + Sync {
    /// Returns the logs of a batch, or `None` if they are not available
    /// (yet). Callers bound how long they wait.
    async fn batch_report(&self, batch_id: &str) -> Option<BatchLogs>;
}

/// Provider for transports that capture no logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLogsProvider;

#[async_trait]
impl LogsProvider for NoLogsProvider {
    async fn batch_report(&self, _batch_id: &str) -> Option<BatchLogs> {
        None
    }
}

/// In-memory provider, filled by a transport as batches finish.
#[derive(Debug, Default)]
pub struct MemoryLogsProvider {
    batches: RwLock<HashMap<String, BatchLogs>>,
}

impl MemoryLogsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider pre-filled with the given batches.
    pub fn with_batches(batches: HashMap<String, BatchLogs>) -> Self {
        Self {
            batches: RwLock::new(batches),
        }
    }

    pub fn insert(&self, batch_id: impl Into<String>, logs: BatchLogs) {
        self.batches
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(batch_id.into(), logs);
    }
}

#[async_trait]
impl LogsProvider for MemoryLogsProvider {
    async fn batch_report(&self, batch_id: &str) -> Option<BatchLogs> {
        self.batches
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(batch_id)
            .cloned()
    }
}
