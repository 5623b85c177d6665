//! Run orchestration: devices in, pools out.
//!
//! The [`Scheduler`] turns the test list into one shard, subscribes to the
//! [`DeviceProvider`] and spawns a [`DevicePoolActor`] the first time a
//! device of a new pool shows up. Every pool receives the same shard.
//!
//! ```text
//!   tests ──► sharding ──► flakiness ──► TestShard
//!                                            │ AddShard (once per pool)
//!   DeviceProvider ──► pooling.pool_for() ───┤
//!        │                                   ▼
//!        │ Connected / Disconnected     DevicePoolActor ...
//!        ▼
//!   AddDevice / RemoveDevice
//! ```
//!
//! The run ends when every spawned pool has shut down. A provider whose
//! stream ends tells all pools that no more devices will come, so pools
//! left without devices stop after their grace period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::{Track, Tracker};
use crate::config::{self, Config, ConfigError};
use crate::execution::{DevicePoolActor, ExecutionContext, PoolMessage};
use crate::logs::{LogsProvider, NoLogsProvider};
use crate::model::{DevicePoolId, Test, TestStatus};
use crate::provider::{DeviceProvider, DeviceProviderEvent, ProviderError};
use crate::report::{SummaryTracker, TestSummary};

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Not a single device connected.
    #[error("No devices connected within {0:?}")]
    NoDevices(Duration),
}

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed |
/// | 1 | Some tests failed or weren't run |
/// | 2 | All tests passed but some were flaky |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Number of (pool, test) pairs that were scheduled.
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    /// Ignored tests and assumption failures.
    pub ignored: usize,
    /// Tests that passed after failing at least once.
    pub flaky: usize,
    /// Scheduled tests that never got a final verdict (pool stopped,
    /// devices gone).
    pub not_run: usize,
    pub duration: Duration,
    pub results: Vec<TestSummary>,
}

impl RunResult {
    /// Folds the per-test summaries of a run.
    ///
    /// `total_tests` is the number of (pool, test) pairs scheduled.
    pub fn from_summaries(results: Vec<TestSummary>, total_tests: usize, duration: Duration) -> Self {
        let count = |pred: fn(&TestSummary) -> bool| results.iter().filter(|s| pred(s)).count();

        let passed = count(|s| s.status == Some(TestStatus::Passed));
        let failed = count(|s| {
            matches!(
                s.status,
                Some(TestStatus::Failure) | Some(TestStatus::Incomplete)
            )
        });
        let ignored = count(|s| {
            matches!(
                s.status,
                Some(TestStatus::Ignored) | Some(TestStatus::AssumptionFailure)
            )
        });
        let flaky = count(TestSummary::is_flaky);
        let finals = count(TestSummary::is_final);

        Self {
            total_tests,
            passed,
            failed,
            ignored,
            flaky,
            not_run: total_tests.saturating_sub(finals),
            duration,
            results,
        }
    }

    /// Returns `true` if no test failed and every scheduled test ran.
    ///
    /// ```
    /// use fleetrun::scheduler::RunResult;
    /// use std::time::Duration;
    ///
    /// let result = RunResult::from_summaries(vec![], 0, Duration::from_secs(1));
    /// assert!(result.success());
    /// assert_eq!(result.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.not_run > 0 {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }
}

/// Drives a whole run across all pools.
///
/// # Example
///
/// ```no_run
/// use fleetrun::config::load_config;
/// use fleetrun::provider;
/// use fleetrun::scheduler::Scheduler;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
///     let devices = provider::from_config(&config.devices, config.run.test_output_timeout());
///     let tests = fleetrun::discovery::load_tests(std::path::Path::new("tests.txt"))?;
///
///     let result = Scheduler::new(config, devices).run(tests).await?;
///     std::process::exit(result.exit_code());
/// }
/// ```
pub struct Scheduler {
    config: Config,
    provider: Box<dyn DeviceProvider>,
    track: Track,
    logs: Arc<dyn LogsProvider>,
    stop: CancellationToken,
}

type PoolJoin = BoxFuture<'static, DevicePoolId>;

impl Scheduler {
    pub fn new(config: Config, provider: Box<dyn DeviceProvider>) -> Self {
        Self {
            config,
            provider,
            track: Track::new(),
            logs: Arc::new(NoLogsProvider),
            stop: CancellationToken::new(),
        }
    }

    /// Uses an existing tracker set instead of a fresh one.
    pub fn with_track(mut self, track: Track) -> Self {
        self.track = track;
        self
    }

    pub fn with_logs_provider(mut self, logs: Arc<dyn LogsProvider>) -> Self {
        self.logs = logs;
        self
    }

    /// Trackers receiving the events of this run.
    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Cancelling this token asks every pool to stop: running batches
    /// finish, nothing new is dispatched.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Runs `tests` on every pool and waits until all pools are done.
    pub async fn run(mut self, tests: Vec<Test>) -> Result<RunResult, SchedulerError> {
        config::validate(&self.config)?;
        let start = Instant::now();

        let ctx = ExecutionContext::from_config(&self.config, self.track.clone())?
            .with_logs_provider(self.logs.clone());
        let summary = Arc::new(SummaryTracker::new());
        self.track.register_arc(summary.clone());

        let shard = ctx
            .strategies
            .flakiness
            .process(ctx.strategies.sharding.create_shard(tests));
        let distinct: HashSet<&Test> = shard.tests.iter().collect();
        let tests_per_pool = distinct.len();
        info!(
            "Scheduling {} tests ({} executions per pool)",
            tests_per_pool,
            shard.executions()
        );

        let init_start = Utc::now();
        let mut events = self.provider.subscribe().await?;
        self.track
            .device_provider_init(self.provider.name(), init_start, Utc::now());

        let no_devices_timeout = self.config.run.no_devices_timeout();
        let no_devices_deadline = tokio::time::sleep(no_devices_timeout);
        tokio::pin!(no_devices_deadline);

        let mut pools: HashMap<DevicePoolId, mpsc::Sender<PoolMessage>> = HashMap::new();
        let mut device_pools: HashMap<String, DevicePoolId> = HashMap::new();
        let mut running: FuturesUnordered<PoolJoin> = FuturesUnordered::new();
        let mut exhausted = false;
        let mut stopping = false;

        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled(), if !stopping => {
                    info!("Stop requested, finishing running batches");
                    stopping = true;
                    for (pool_id, sender) in &pools {
                        send(pool_id, sender, PoolMessage::RequestStop).await;
                    }
                }
                event = events.next(), if !exhausted => match event {
                    Some(DeviceProviderEvent::Connected(device)) => {
                        let info = device.info();
                        let pool_id = ctx.strategies.pooling.pool_for(&info);
                        if !pools.contains_key(&pool_id) {
                            info!("Creating pool {}", pool_id);
                            let handle = DevicePoolActor::spawn(pool_id.clone(), ctx.clone());
                            let sender = handle.sender();
                            send(&pool_id, &sender, PoolMessage::AddShard(shard.clone())).await;
                            if stopping {
                                send(&pool_id, &sender, PoolMessage::RequestStop).await;
                            }
                            pools.insert(pool_id.clone(), sender);
                            let id = pool_id.clone();
                            running.push(Box::pin(async move {
                                handle.join().await;
                                id
                            }));
                        }
                        device_pools.insert(info.serial_number.clone(), pool_id.clone());
                        if let Some(sender) = pools.get(&pool_id) {
                            send(&pool_id, sender, PoolMessage::AddDevice(device)).await;
                        }
                    }
                    Some(DeviceProviderEvent::Disconnected(info)) => {
                        match device_pools.remove(&info.serial_number) {
                            Some(pool_id) => {
                                if let Some(sender) = pools.get(&pool_id) {
                                    let message = PoolMessage::RemoveDevice(info.serial_number.clone());
                                    send(&pool_id, sender, message).await;
                                }
                            }
                            None => warn!("Unknown device {} disconnected", info.serial_number),
                        }
                    }
                    None => {
                        info!("Device provider has no more devices");
                        exhausted = true;
                        if pools.is_empty() {
                            self.provider.terminate().await;
                            return Err(SchedulerError::NoDevices(start.elapsed()));
                        }
                        for (pool_id, sender) in &pools {
                            send(pool_id, sender, PoolMessage::DevicesExhausted).await;
                        }
                    }
                },
                Some(pool_id) = running.next(), if !running.is_empty() => {
                    info!(
                        "Pool {} finished, overall progress {:.0}%",
                        pool_id,
                        ctx.progress.progress() * 100.0
                    );
                    if running.is_empty() {
                        break;
                    }
                }
                _ = &mut no_devices_deadline, if pools.is_empty() => {
                    self.provider.terminate().await;
                    return Err(SchedulerError::NoDevices(no_devices_timeout));
                }
            }
        }

        self.provider.terminate().await;
        self.track.close();

        let result = RunResult::from_summaries(
            summary.summaries(),
            pools.len() * tests_per_pool,
            start.elapsed(),
        );
        Ok(result)
    }
}

/// Sends to a pool, tolerating pools that already shut down.
async fn send(pool_id: &DevicePoolId, sender: &mpsc::Sender<PoolMessage>, message: PoolMessage) {
    if let Err(e) = sender.send(message).await {
        debug!("Pool {} is gone, dropping {:?}", pool_id, e.0);
    }
}
