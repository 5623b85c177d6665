//! The per-pool actor hierarchy.
//!
//! Each pool runs three kinds of tokio tasks that talk only through
//! bounded `mpsc` inboxes:
//!
//! ```text
//!              PoolMessage                 QueueMessage
//! Scheduler ──────────────▶ DevicePoolActor ◀──────────▶ QueueActor
//!                              │      ▲
//!                  DeviceEvent │      │ PoolMessage
//!                              ▼      │
//!                           DeviceActor (one per device)
//! ```
//!
//! - [`QueueActor`](queue::QueueActor) owns pending tests and active
//!   batches. It is the only place where test ownership changes.
//! - [`DeviceActor`](device::DeviceActor) owns one [`Device`](crate::model::Device)
//!   and executes at most one batch at a time.
//! - [`DevicePoolActor`](pool::DevicePoolActor) owns the device workers and
//!   routes messages between them and the queue.
//!
//! Every actor handles one message at a time, so none of them needs locks
//! on its own state. The only state shared between pools is the
//! [`ProgressReporter`] and the [`Track`] sink, both carried in
//! [`ExecutionContext`].

pub mod device;
pub mod messages;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod strict;

use std::sync::Arc;

use regex::Regex;

pub use device::{DeviceActor, DeviceHandle, DeviceState};
pub use messages::{DeviceEvent, PoolMessage, QueueMessage};
pub use pool::{DevicePoolActor, PoolHandle};
pub use progress::ProgressReporter;
pub use queue::QueueActor;
pub use strict::{ConfigurationStrictRunChecker, StrictRunChecker};

use crate::analytics::Track;
use crate::config::{self, Config, ConfigError, RunConfig};
use crate::logs::{LogsProvider, NoLogsProvider};
use crate::strategy::Strategies;

/// Capacity of queue and pool inboxes.
pub const INBOX_CAPACITY: usize = 1024;

/// Capacity of device worker inboxes.
pub const DEVICE_INBOX_CAPACITY: usize = 16;

/// Everything a pool needs from the run, shared read-only by all actors.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run: Arc<RunConfig>,
    pub strategies: Strategies,
    pub track: Track,
    pub progress: Arc<ProgressReporter>,
    pub logs: Arc<dyn LogsProvider>,
    pub strict: Arc<dyn StrictRunChecker>,
    pub crash_patterns: Arc<Vec<Regex>>,
}

impl ExecutionContext {
    /// Builds a context from a validated configuration.
    pub fn from_config(config: &Config, track: Track) -> Result<Self, ConfigError> {
        Ok(Self {
            run: Arc::new(config.run.clone()),
            strategies: Strategies::from_config(&config.strategies),
            track,
            progress: Arc::new(ProgressReporter::new()),
            logs: Arc::new(NoLogsProvider),
            strict: Arc::new(ConfigurationStrictRunChecker::from_config(config)?),
            crash_patterns: Arc::new(config::compile_regexes(&config.run.ignore_crash_regexes)?),
        })
    }

    pub fn with_logs_provider(mut self, logs: Arc<dyn LogsProvider>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_strategies(mut self, strategies: Strategies) -> Self {
        self.strategies = strategies;
        self
    }

    /// Returns true if `text` matches any ignore-crash pattern.
    pub fn is_ignored_crash(&self, text: &str) -> bool {
        self.crash_patterns.iter().any(|r| r.is_match(text))
    }
}
