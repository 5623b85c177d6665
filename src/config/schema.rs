//! Configuration schema definitions for fleetrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Strategy and device-provider selection use
//! serde tagged enums, like the provider selection of the original runner.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Quotas, timeouts, strict mode, crash regexes
//! ├── StrategiesConfig       - Tagged enums selecting each policy
//! │   ├── BatchingConfig     - isolate | fixed-size
//! │   ├── RetryConfig        - no-retry | fixed-quota
//! │   ├── FlakinessConfig    - ignore | fixed
//! │   ├── ShardingConfig     - parallel | count
//! │   └── PoolingConfig      - omni | model | operating-system | manufacturer | abi
//! ├── strict_run_filter      - List of TestFilter
//! ├── DevicesConfig          - Tagged enum selecting the device provider
//! └── ReportConfig           - Output settings
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use fleetrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [run]
///     uncompleted_test_retry_quota = 2
///
///     [strategies.batching]
///     type = "fixed-size"
///     size = 5
///
///     [devices]
///     type = "local"
///     count = 2
///     command = "./run-tests.sh {tests}"
/// "#).unwrap();
///
/// assert_eq!(config.run.uncompleted_test_retry_quota, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings (quotas, timeouts, strict mode).
    #[serde(default)]
    pub run: RunConfig,

    /// Policy selection.
    #[serde(default)]
    pub strategies: StrategiesConfig,

    /// Tests matching any of these filters must pass on their first attempt.
    #[serde(default)]
    pub strict_run_filter: Vec<TestFilter>,

    /// Device provider configuration (optional, defaults to one local device).
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `uncompleted_test_retry_quota` | 3 |
/// | `ignore_crash_regexes` | empty |
/// | `strict_mode` | false |
/// | `test_batch_timeout_millis` | 900000 (15 minutes) |
/// | `test_output_timeout_millis` | 60000 |
/// | `no_devices_timeout_secs` | 300 |
/// | `logs_wait_timeout_millis` | 2000 |
/// | `cache_enabled` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// How many times per pool a test without a verdict may be requeued.
    ///
    /// Uncompleted attempts (device lost, batch timeout, crash matching
    /// `ignore_crash_regexes`) draw from this quota instead of the retry
    /// strategy. Zero makes every uncompleted attempt final.
    #[serde(default = "default_uncompleted_quota")]
    pub uncompleted_test_retry_quota: u32,

    /// Failures whose stack trace or crash log matches one of these
    /// patterns are charged against the uncompleted quota.
    #[serde(default)]
    pub ignore_crash_regexes: Vec<String>,

    /// When set, every test is a strict run: its first failure is final.
    #[serde(default)]
    pub strict_mode: bool,

    /// Maximum time a single batch may run on a device.
    #[serde(default = "default_batch_timeout")]
    pub test_batch_timeout_millis: u64,

    /// Maximum silence between two output lines of a running batch.
    #[serde(default = "default_output_timeout")]
    pub test_output_timeout_millis: u64,

    /// Grace period before a pool without devices shuts down.
    #[serde(default = "default_no_devices_timeout")]
    pub no_devices_timeout_secs: u64,

    /// How long the queue waits for batch logs before giving up.
    #[serde(default = "default_logs_wait_timeout")]
    pub logs_wait_timeout_millis: u64,

    /// Whether test results may be served from a result cache.
    #[serde(default)]
    pub cache_enabled: bool,
}

fn default_uncompleted_quota() -> u32 {
    3
}

fn default_batch_timeout() -> u64 {
    900_000 // 15 minutes
}

fn default_output_timeout() -> u64 {
    60_000
}

fn default_no_devices_timeout() -> u64 {
    300 // 5 minutes
}

fn default_logs_wait_timeout() -> u64 {
    2_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            uncompleted_test_retry_quota: default_uncompleted_quota(),
            ignore_crash_regexes: Vec::new(),
            strict_mode: false,
            test_batch_timeout_millis: default_batch_timeout(),
            test_output_timeout_millis: default_output_timeout(),
            no_devices_timeout_secs: default_no_devices_timeout(),
            logs_wait_timeout_millis: default_logs_wait_timeout(),
            cache_enabled: false,
        }
    }
}

impl RunConfig {
    pub fn test_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.test_batch_timeout_millis)
    }

    pub fn test_output_timeout(&self) -> Duration {
        Duration::from_millis(self.test_output_timeout_millis)
    }

    pub fn no_devices_timeout(&self) -> Duration {
        Duration::from_secs(self.no_devices_timeout_secs)
    }

    pub fn logs_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.logs_wait_timeout_millis)
    }
}

/// Policy selection. Every strategy has a trivial default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub flakiness: FlakinessConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub pooling: PoolingConfig,
}

/// How pending tests are grouped into batches.
///
/// ```toml
/// [strategies.batching]
/// type = "fixed-size"
/// size = 10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BatchingConfig {
    /// One test per batch.
    #[default]
    Isolate,
    /// Up to `size` distinct tests of one component per batch.
    FixedSize { size: usize },
}

/// How failed tests are retried.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RetryConfig {
    NoRetry,
    /// Retries each failed test up to `retry_per_test_quota` times while the
    /// pool-wide budget `total_allowed_retry_quota` lasts.
    FixedQuota {
        #[serde(default = "default_total_retry_quota")]
        total_allowed_retry_quota: u32,
        #[serde(default = "default_retry_per_test_quota")]
        retry_per_test_quota: u32,
    },
}

fn default_total_retry_quota() -> u32 {
    200
}

fn default_retry_per_test_quota() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::FixedQuota {
            total_allowed_retry_quota: default_total_retry_quota(),
            retry_per_test_quota: default_retry_per_test_quota(),
        }
    }
}

/// Preventive executions scheduled up front for every test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FlakinessConfig {
    #[default]
    Ignore,
    /// Schedules `attempts` additional executions per test; any passing
    /// attempt makes the test pass.
    Fixed { attempts: usize },
}

impl FlakinessConfig {
    pub fn is_trivial(&self) -> bool {
        matches!(self, FlakinessConfig::Ignore)
    }
}

/// How the suite is turned into a pool shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ShardingConfig {
    /// Every test once.
    #[default]
    Parallel,
    /// Every test `count` times.
    Count { count: usize },
}

impl ShardingConfig {
    pub fn is_trivial(&self) -> bool {
        matches!(self, ShardingConfig::Parallel)
    }
}

/// How devices are grouped into pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolingConfig {
    /// All devices in one pool.
    #[default]
    Omni,
    Model,
    OperatingSystem,
    Manufacturer,
    Abi,
}

/// A predicate over tests used by the strict-run filter.
///
/// ```toml
/// [[strict_run_filter]]
/// type = "annotation"
/// name = "com.example.Strict"
///
/// [[strict_run_filter]]
/// type = "fully-qualified-class-name"
/// regex = "com\\.example\\.payments\\..*"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TestFilter {
    FullyQualifiedClassName { regex: String },
    SimpleClassName { regex: String },
    Package { regex: String },
    Method { regex: String },
    Component { regex: String },
    Annotation { name: String },
}

/// Device provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DevicesConfig {
    /// Virtual devices that run a shell command per batch.
    Local(LocalDevicesConfig),
}

impl Default for DevicesConfig {
    fn default() -> Self {
        DevicesConfig::Local(LocalDevicesConfig::default())
    }
}

/// Configuration for local process devices.
///
/// `command` is split with shell-words; the `{tests}` placeholder is
/// replaced by the batch tests as separate `pkg.Class#method` arguments.
/// The command reports results on stdout, one per line:
///
/// ```text
/// PASSED com.example.LoginTest#valid
/// FAILED com.example.LoginTest#invalid: expected 401 but was 500
/// IGNORED com.example.LoginTest#legacy
/// ```
///
/// # Example
///
/// ```toml
/// [devices]
/// type = "local"
/// count = 4
/// command = "./scripts/run-batch.sh {tests}"
/// model = "linux-x86"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalDevicesConfig {
    /// Number of virtual devices to create.
    #[serde(default = "default_device_count")]
    pub count: usize,

    /// Command run once per batch.
    #[serde(default = "default_local_command")]
    pub command: String,

    /// Working directory for spawned processes.
    pub working_dir: Option<PathBuf>,

    /// Model reported in the device snapshot, used by model pooling.
    #[serde(default = "default_local_model")]
    pub model: String,

    /// Extra environment variables for spawned processes.
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

fn default_device_count() -> usize {
    1
}

fn default_local_command() -> String {
    "true".to_string()
}

fn default_local_model() -> String {
    "local".to_string()
}

impl Default for LocalDevicesConfig {
    fn default() -> Self {
        Self {
            count: default_device_count(),
            command: default_local_command(),
            working_dir: None,
            model: default_local_model(),
            env: Default::default(),
        }
    }
}

/// Report configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where the JSON execution summary is written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write `summary.json` into `output_dir`.
    #[serde(default = "default_true")]
    pub json: bool,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("fleetrun-output")
}

fn default_true() -> bool {
    true
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json: true,
        }
    }
}
