//! Lifecycle event tracking.
//!
//! Every actor reports what it does to a [`Track`], a multicast
//! [`Tracker`] that forwards each event to all registered trackers.
//! Trackers may be registered at any time, including while pools are
//! running; events are fanned out in registration order, but no ordering
//! is promised across trackers.
//!
//! The `test` event is the externally observable contract of a run: each
//! test of every shard receives exactly one event with `is_final = true`,
//! unless its pool was stopped first.

pub mod logging;

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::model::{DeviceInfo, DevicePoolId, Test, TestResult};

pub use logging::LoggingTracker;

/// Receives lifecycle events. All methods default to no-ops.
pub trait Tracker: Send + Sync {
    fn device_provider_init(&self, _serial: &str, _start: DateTime<Utc>, _finish: DateTime<Utc>) {}

    fn device_preparing(&self, _serial: &str, _start: DateTime<Utc>, _finish: DateTime<Utc>) {}

    fn installation_check(&self, _serial: &str, _start: DateTime<Utc>, _finish: DateTime<Utc>) {}

    fn installation(&self, _serial: &str, _start: DateTime<Utc>, _finish: DateTime<Utc>) {}

    fn executing_batch(&self, _serial: &str, _start: DateTime<Utc>, _finish: DateTime<Utc>) {}

    fn cache_store(&self, _start: DateTime<Utc>, _finish: DateTime<Utc>, _test: &Test) {}

    fn cache_load(&self, _start: DateTime<Utc>, _finish: DateTime<Utc>, _test: &Test) {}

    fn device_connected(&self, _pool: &DevicePoolId, _device: &DeviceInfo) {}

    /// One attempt of a test reached a verdict. `is_final` marks the
    /// attempt used for reporting.
    fn test(&self, _pool: &DevicePoolId, _device: &DeviceInfo, _result: &TestResult, _is_final: bool) {}

    fn close(&self) {}
}

/// Multicast tracker.
///
/// Cloning a `Track` yields a handle to the same set of trackers.
///
/// # Example
///
/// ```
/// use fleetrun::analytics::{LoggingTracker, Track};
///
/// let track = Track::new();
/// track.register(LoggingTracker);
/// assert_eq!(track.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct Track {
    delegates: Arc<RwLock<Vec<Arc<dyn Tracker>>>>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tracker; it receives every event emitted after this call.
    pub fn register<T: Tracker + 'static>(&self, tracker: T) {
        self.register_arc(Arc::new(tracker));
    }

    /// Adds a shared tracker, keeping a handle for the caller.
    pub fn register_arc(&self, tracker: Arc<dyn Tracker>) {
        let mut delegates = self
            .delegates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        delegates.push(tracker);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the tracker list so fan-out never holds the lock while a
    /// tracker runs.
    fn snapshot(&self) -> Vec<Arc<dyn Tracker>> {
        self.delegates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Runs `block` and reports its duration as `device_preparing`.
    pub async fn track_device_preparing<F, T>(&self, serial: &str, block: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let start = Utc::now();
        let output = block.await;
        self.device_preparing(serial, start, Utc::now());
        output
    }

    /// Runs `block` and reports its duration as `executing_batch`.
    pub async fn track_executing_batch<F, T>(&self, serial: &str, block: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let start = Utc::now();
        let output = block.await;
        self.executing_batch(serial, start, Utc::now());
        output
    }
}

impl Tracker for Track {
    fn device_provider_init(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        for tracker in self.snapshot() {
            tracker.device_provider_init(serial, start, finish);
        }
    }

    fn device_preparing(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        for tracker in self.snapshot() {
            tracker.device_preparing(serial, start, finish);
        }
    }

    fn installation_check(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        for tracker in self.snapshot() {
            tracker.installation_check(serial, start, finish);
        }
    }

    fn installation(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        for tracker in self.snapshot() {
            tracker.installation(serial, start, finish);
        }
    }

    fn executing_batch(&self, serial: &str, start: DateTime<Utc>, finish: DateTime<Utc>) {
        for tracker in self.snapshot() {
            tracker.executing_batch(serial, start, finish);
        }
    }

    fn cache_store(&self, start: DateTime<Utc>, finish: DateTime<Utc>, test: &Test) {
        for tracker in self.snapshot() {
            tracker.cache_store(start, finish, test);
        }
    }

    fn cache_load(&self, start: DateTime<Utc>, finish: DateTime<Utc>, test: &Test) {
        for tracker in self.snapshot() {
            tracker.cache_load(start, finish, test);
        }
    }

    fn device_connected(&self, pool: &DevicePoolId, device: &DeviceInfo) {
        for tracker in self.snapshot() {
            tracker.device_connected(pool, device);
        }
    }

    fn test(&self, pool: &DevicePoolId, device: &DeviceInfo, result: &TestResult, is_final: bool) {
        for tracker in self.snapshot() {
            tracker.test(pool, device, result, is_final);
        }
    }

    fn close(&self) {
        for tracker in self.snapshot() {
            tracker.close();
        }
    }
}

/// Tracker that records `test` events, used by tests across the crate.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingTracker {
    pub(crate) events: std::sync::Mutex<Vec<(DevicePoolId, TestResult, bool)>>,
}

#[cfg(test)]
impl RecordingTracker {
    pub(crate) fn finals(&self) -> Vec<TestResult> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, is_final)| *is_final)
            .map(|(_, r, _)| r.clone())
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<(TestResult, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r, f)| (r.clone(), *f))
            .collect()
    }
}

#[cfg(test)]
impl Tracker for RecordingTracker {
    fn test(&self, pool: &DevicePoolId, _device: &DeviceInfo, result: &TestResult, is_final: bool) {
        self.events
            .lock()
            .unwrap()
            .push((pool.clone(), result.clone(), is_final));
    }
}
