//! Tracker that mirrors lifecycle events into `tracing`.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::Tracker;
use crate::model::{DeviceInfo, DevicePoolId, TestResult};

/// Logs device lifecycle at debug level and final test verdicts at info.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTracker;

fn millis(start: DateTime<Utc>, finish: DateTime<Utc>) -> i64 {
    (finish - start).num_milliseconds()
}

impl Tracker for LoggingTracker {
    fn device_provider_init(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        debug!(serial, elapsed_ms = millis(start, finish), "device provider init");
    }

    fn device_preparing(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        debug!(serial, elapsed_ms = millis(start, finish), "device prepared");
    }

    fn executing_batch(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        debug!(serial, elapsed_ms = millis(start, finish), "batch executed");
    }

    fn device_connected(&self, pool: &DevicePoolId, device: &DeviceInfo) {
        info!("Device {} connected to pool {}", device, pool);
    }

    fn test(&self, pool: &DevicePoolId, device: &DeviceInfo, result: &TestResult, is_final: bool) {
        if is_final {
            info!(
                "[{}] {} {} on {}",
                pool, result.status, result.test, device.serial_number
            );
        } else {
            debug!(
                "[{}] {} {} on {} (will be retried)",
                pool, result.status, result.test, device.serial_number
            );
        }
    }
}
