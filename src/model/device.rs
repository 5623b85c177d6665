//! Devices: the live [`Device`] handle and its [`DeviceInfo`] snapshot.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::batch::TestBatch;
use super::result::TestResult;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors raised by a [`Device`].
///
/// The device worker maps these onto batch outcomes:
///
/// | Variant | Outcome |
/// |---------|---------|
/// | `NotReady` | batch returned to the queue untouched |
/// | `Lost`, `Timeout`, `ExecFailed`, `Other` | unfinished tests reported as uncompleted |
/// | `PrepareFailed` | device removed from its pool |
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device could not start the batch (e.g. lost connectivity before
    /// anything ran). The batch is handed back without retry cost.
    #[error("Device not ready: {0}")]
    NotReady(String),

    /// The device disappeared while the batch was running.
    #[error("Device lost: {0}")]
    Lost(String),

    /// Device bring-up failed.
    #[error("Failed to prepare device: {0}")]
    PrepareFailed(String),

    /// The batch produced no output for too long or exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The batch could not be executed.
    #[error("Failed to execute batch: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Stable name of a device pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePoolId(pub String);

impl DevicePoolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional capabilities a device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFeature {
    Screenshot,
    Video,
}

/// Immutable snapshot of a device, safe to pass between actors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub operating_system: String,
    pub model: String,
    pub manufacturer: String,
    pub abi: String,
    #[serde(default)]
    pub features: Vec<DeviceFeature>,
    pub healthy: bool,
}

impl DeviceInfo {
    /// Creates a healthy device snapshot with only a serial number set.
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            operating_system: "unknown".to_string(),
            model: "unknown".to_string(),
            manufacturer: "unknown".to_string(),
            abi: "unknown".to_string(),
            features: Vec::new(),
            healthy: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_operating_system(mut self, os: impl Into<String>) -> Self {
        self.operating_system = os.into();
        self
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial_number, self.model)
    }
}

/// A live execution device.
///
/// A device is owned by exactly one device worker for its whole lifetime;
/// other actors only ever see its [`DeviceInfo`].
///
/// # Implementing a device
///
/// ```no_run
/// use async_trait::async_trait;
/// use fleetrun::model::*;
///
/// struct Emulator { info: DeviceInfo }
///
/// #[async_trait]
/// impl Device for Emulator {
///     fn info(&self) -> DeviceInfo { self.info.clone() }
///     async fn prepare(&mut self) -> DeviceResult<()> { Ok(()) }
///     async fn execute(&mut self, batch: &TestBatch) -> DeviceResult<Vec<TestResult>> { todo!() }
///     async fn dispose(&mut self) {}
/// }
/// ```
#[async_trait]
pub trait Device: Send + Sync {
    /// Serial number used as the device key inside its pool.
    fn serial_number(&self) -> String {
        self.info().serial_number
    }

    /// Returns the current snapshot of this device.
    fn info(&self) -> DeviceInfo;

    /// Brings the device up (install, clear state, warm up).
    async fn prepare(&mut self) -> DeviceResult<()>;

    /// Runs a batch and returns one result per test that reached a verdict.
    ///
    /// Tests missing from the returned list are treated as uncompleted.
    async fn execute(&mut self, batch: &TestBatch) -> DeviceResult<Vec<TestResult>>;

    /// Releases the device. Called once when the worker terminates.
    async fn dispose(&mut self);
}
