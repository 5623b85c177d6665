//! fleetrun: a distributed test runner for device fleets.
//!
//! This crate schedules a test suite across pools of devices, runs each
//! batch on one device, and retries what did not finish until every test
//! has exactly one final verdict per pool.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: Load the test list ([`discovery`])
//! - **Providers**: Announce devices as they connect ([`provider`])
//! - **Scheduler**: Shard the suite and route devices to pools ([`scheduler`])
//! - **Execution**: Per-pool queue, supervisor and device actors ([`execution`])
//! - **Strategies**: Batching, retry, flakiness, sharding and pooling ([`strategy`])
//! - **Analytics & Report**: Lifecycle events and run summaries ([`analytics`], [`report`])
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::load_config;
//! use fleetrun::{discovery, provider, scheduler::Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
//!     let tests = discovery::load_tests(std::path::Path::new("tests.txt"))?;
//!     let devices = provider::from_config(&config.devices, config.run.test_output_timeout());
//!
//!     let result = Scheduler::new(config, devices).run(tests).await?;
//!     fleetrun::report::print_summary(&result);
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod logs;
pub mod model;
pub mod provider;
pub mod report;
pub mod scheduler;
pub mod strategy;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use model::{Device, DeviceInfo, Test, TestResult, TestStatus};
pub use provider::{DeviceProvider, DeviceProviderEvent};
pub use scheduler::{RunResult, Scheduler, SchedulerError};
