//! Pool supervisor.
//!
//! A [`DevicePoolActor`] owns the device workers of one pool and the
//! queue feeding them. It never looks at tests itself: it tracks which
//! workers are idle, asks the queue for work on their behalf and relays
//! the answers.
//!
//! # Worker status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `Initializing` | `Initialize` sent, waiting for `DeviceReady` |
//! | `Idle` | ready, no request outstanding |
//! | `Awaiting` | `RequestBatch` sent to the queue for this device |
//! | `Busy` | batch handed to the worker, until its results come back |
//!
//! # Termination
//!
//! The pool exits when its queue reports `QueueTerminated`. When the last
//! device leaves after a stop request, or after the provider announced
//! that no more devices will come, a grace timer is armed; a device that
//! connects in time disarms it, otherwise the pool stops its queue and
//! exits with whatever is still pending.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{DeviceActor, DeviceHandle};
use super::messages::{DeviceEvent, PoolMessage, QueueMessage};
use super::queue::QueueActor;
use super::{ExecutionContext, INBOX_CAPACITY};
use crate::analytics::Tracker;
use crate::model::{Device, DeviceInfo, DevicePoolId, TestBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Initializing,
    Idle,
    Awaiting,
    Busy,
}

struct Worker {
    handle: DeviceHandle,
    status: WorkerStatus,
}

/// The scheduler's side of a running pool.
pub struct PoolHandle {
    id: DevicePoolId,
    sender: mpsc::Sender<PoolMessage>,
    join: JoinHandle<()>,
}

impl PoolHandle {
    pub fn id(&self) -> &DevicePoolId {
        &self.id
    }

    pub async fn send(&self, message: PoolMessage) -> Result<(), SendError<PoolMessage>> {
        self.sender.send(message).await
    }

    /// A cloned inbox handle, usable after [`join`](Self::join) consumed the pool.
    pub fn sender(&self) -> mpsc::Sender<PoolMessage> {
        self.sender.clone()
    }

    /// Waits until the pool has shut down.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!("Pool {} panicked: {}", self.id, e);
        }
    }
}

/// Supervisor of one device pool.
pub struct DevicePoolActor {
    id: DevicePoolId,
    ctx: ExecutionContext,
    self_tx: mpsc::Sender<PoolMessage>,
    queue: mpsc::Sender<QueueMessage>,
    queue_join: Option<JoinHandle<()>>,
    workers: HashMap<String, Worker>,
    token: CancellationToken,
    stop_requested: bool,
    devices_exhausted: bool,
    grace_deadline: Option<Instant>,
}

impl DevicePoolActor {
    /// Creates a pool talking to an existing queue inbox.
    pub fn new(
        id: DevicePoolId,
        ctx: ExecutionContext,
        self_tx: mpsc::Sender<PoolMessage>,
        queue: mpsc::Sender<QueueMessage>,
    ) -> Self {
        Self {
            id,
            ctx,
            self_tx,
            queue,
            queue_join: None,
            workers: HashMap::new(),
            token: CancellationToken::new(),
            stop_requested: false,
            devices_exhausted: false,
            grace_deadline: None,
        }
    }

    /// Starts a pool and its queue.
    pub fn spawn(id: DevicePoolId, ctx: ExecutionContext) -> PoolHandle {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (queue, queue_join) = QueueActor::spawn(id.clone(), ctx.clone(), sender.clone());
        let mut actor = Self::new(id.clone(), ctx, sender.clone(), queue);
        actor.queue_join = Some(queue_join);
        PoolHandle {
            id,
            sender,
            join: tokio::spawn(actor.run(inbox)),
        }
    }

    pub fn device_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_grace_timer_armed(&self) -> bool {
        self.grace_deadline.is_some()
    }

    /// Processes messages until the queue terminates or the grace timer
    /// fires, then tears down every worker.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<PoolMessage>) {
        info!("[{}] pool started", self.id);
        loop {
            let deadline = self.grace_deadline;
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => {
                        if !self.handle(message).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        "[{}] no devices for {:?}, terminating pool",
                        self.id,
                        self.ctx.run.no_devices_timeout()
                    );
                    if !self.stop_requested {
                        self.stop_requested = true;
                        self.to_queue(QueueMessage::Stop).await;
                    }
                    break;
                }
            }
        }
        inbox.close();
        self.shutdown().await;
    }

    /// Handles one message. Returns false once the pool should exit.
    pub async fn handle(&mut self, message: PoolMessage) -> bool {
        debug!("[{}] {:?}", self.id, message);
        match message {
            PoolMessage::AddDevice(device) => self.add_device(device).await,
            PoolMessage::RemoveDevice(serial) => self.remove_device(&serial),
            PoolMessage::AddShard(shard) => self.to_queue(QueueMessage::AddShard(shard)).await,
            PoolMessage::DevicesExhausted => {
                self.devices_exhausted = true;
                self.arm_grace_timer();
            }
            PoolMessage::RequestStop => self.request_stop().await,
            PoolMessage::DeviceReady(device) => self.device_ready(device).await,
            PoolMessage::DeviceTerminated(device) => {
                warn!("[{}] {} terminated, removing it", self.id, device);
                self.remove_device(&device.serial_number);
            }
            PoolMessage::CompletedTestBatch(device, results) => {
                self.batch_finished(&device);
                self.to_queue(QueueMessage::Completed(device, results)).await
            }
            PoolMessage::ReturnTestBatch(device, batch) => {
                self.batch_finished(&device);
                self.to_queue(QueueMessage::ReturnBatch(device, batch)).await
            }
            PoolMessage::Notify => {
                for worker in self.workers.values() {
                    worker.handle.wake_up();
                }
            }
            PoolMessage::NoWork(device) => {
                if let Some(worker) = self.workers.get_mut(&device.serial_number)
                    && worker.status == WorkerStatus::Awaiting
                {
                    worker.status = WorkerStatus::Idle;
                }
            }
            PoolMessage::ExecuteBatch(device, batch) => self.execute_batch(device, batch).await,
            PoolMessage::QueueTerminated => {
                info!("[{}] queue terminated", self.id);
                return false;
            }
        }
        true
    }

    async fn to_queue(&self, message: QueueMessage) {
        if self.queue.send(message).await.is_err() {
            warn!("[{}] queue is gone, dropping message", self.id);
        }
    }

    async fn request_stop(&mut self) {
        if !self.stop_requested {
            self.stop_requested = true;
            self.to_queue(QueueMessage::Stop).await;
        }
        self.arm_grace_timer();
    }

    fn arm_grace_timer(&mut self) {
        let abandoned = self.stop_requested || self.devices_exhausted;
        if self.workers.is_empty() && abandoned && self.grace_deadline.is_none() {
            let timeout = self.ctx.run.no_devices_timeout();
            info!("[{}] no devices left, terminating in {:?} unless one connects", self.id, timeout);
            self.grace_deadline = Some(Instant::now() + timeout);
        }
    }

    async fn add_device(&mut self, device: Box<dyn Device>) {
        let info = device.info();
        if self.workers.contains_key(&info.serial_number) {
            warn!("[{}] {} is already connected, ignoring", self.id, info.serial_number);
            return;
        }
        if self.grace_deadline.take().is_some() {
            info!("[{}] {} connected, grace timer cancelled", self.id, info.serial_number);
        }

        let handle = DeviceActor::spawn(
            self.id.clone(),
            device,
            self.self_tx.clone(),
            self.ctx.clone(),
            self.token.child_token(),
        );
        if handle.send(DeviceEvent::Initialize).await.is_err() {
            error!("[{}] worker of {} exited before initialization", self.id, info.serial_number);
            return;
        }

        self.ctx.track.device_connected(&self.id, &info);
        self.workers.insert(
            info.serial_number.clone(),
            Worker {
                handle,
                status: WorkerStatus::Initializing,
            },
        );
    }

    fn remove_device(&mut self, serial: &str) {
        let Some(worker) = self.workers.remove(serial) else {
            debug!("[{}] {} is not part of this pool", self.id, serial);
            return;
        };
        info!("[{}] removing {}", self.id, serial);
        // An in-flight batch comes back as uncompleted through our inbox.
        tokio::spawn(worker.handle.shutdown());
        self.arm_grace_timer();
    }

    /// Workers report their batch before their readiness, so a finished
    /// batch is what frees a busy worker.
    fn batch_finished(&mut self, device: &DeviceInfo) {
        if let Some(worker) = self.workers.get_mut(&device.serial_number)
            && worker.status == WorkerStatus::Busy
        {
            worker.status = WorkerStatus::Idle;
        }
    }

    async fn device_ready(&mut self, device: DeviceInfo) {
        match self.workers.get_mut(&device.serial_number) {
            Some(worker) if worker.status == WorkerStatus::Awaiting => return,
            Some(worker) if worker.status == WorkerStatus::Busy => {
                debug!("[{}] ignoring stale readiness of busy {}", self.id, device.serial_number);
                return;
            }
            Some(worker) => worker.status = WorkerStatus::Idle,
            None => {
                debug!("[{}] ignoring readiness of removed {}", self.id, device.serial_number);
                return;
            }
        }
        self.request_work(Some(&device.serial_number)).await;
    }

    /// Asks the queue for work on behalf of a random idle device, avoiding
    /// `avoid` unless it is the only idle one.
    async fn request_work(&mut self, avoid: Option<&str>) {
        let chosen = {
            let idle: Vec<&String> = self
                .workers
                .iter()
                .filter(|(_, w)| w.status == WorkerStatus::Idle)
                .map(|(serial, _)| serial)
                .collect();
            let preferred: Vec<&String> = idle
                .iter()
                .copied()
                .filter(|s| Some(s.as_str()) != avoid)
                .collect();
            preferred
                .choose(&mut rand::thread_rng())
                .or_else(|| idle.first())
                .map(|s| (*s).clone())
        };
        let Some(serial) = chosen else {
            return;
        };
        let Some(worker) = self.workers.get_mut(&serial) else {
            return;
        };
        worker.status = WorkerStatus::Awaiting;
        let info = worker.handle.info().clone();
        self.to_queue(QueueMessage::RequestBatch(info)).await;
    }

    async fn execute_batch(&mut self, device: DeviceInfo, batch: TestBatch) {
        let sent = match self.workers.get(&device.serial_number) {
            Some(worker) => worker.handle.send(DeviceEvent::Execute(batch)).await,
            None => Err(SendError(DeviceEvent::Execute(batch))),
        };

        match sent {
            Ok(()) => {
                if let Some(worker) = self.workers.get_mut(&device.serial_number) {
                    worker.status = WorkerStatus::Busy;
                }
                // Keep filling idle devices while the queue has work.
                self.request_work(None).await;
            }
            Err(SendError(DeviceEvent::Execute(batch))) => {
                warn!(
                    "[{}] {} is gone, returning batch {}",
                    self.id, device.serial_number, batch.id
                );
                self.workers.remove(&device.serial_number);
                self.to_queue(QueueMessage::ReturnBatch(device, batch)).await;
            }
            Err(_) => {}
        }
    }

    async fn shutdown(self) {
        info!("[{}] terminating {} devices", self.id, self.workers.len());
        self.token.cancel();

        let Self {
            workers,
            queue,
            queue_join,
            ..
        } = self;
        futures::future::join_all(workers.into_values().map(|w| w.handle.shutdown())).await;

        drop(queue);
        if let Some(join) = queue_join
            && let Err(e) = join.await
        {
            error!("Queue panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::analytics::{RecordingTracker, Track};
    use crate::config::{Config, RunConfig};
    use crate::execution::device::fake::{Behavior, FakeDevice};
    use crate::model::{ComponentInfo, Test, TestBatchResults, TestShard, TestStatus};

    fn test(method: &str) -> Test {
        Test::new("com.example", "Suite", method, ComponentInfo::default())
    }

    fn context(recorder: Arc<RecordingTracker>) -> ExecutionContext {
        let config = Config {
            run: RunConfig {
                no_devices_timeout_secs: 60,
                ..RunConfig::default()
            },
            ..Config::default()
        };
        let track = Track::new();
        track.register_arc(recorder);
        ExecutionContext::from_config(&config, track).unwrap()
    }

    async fn join(handle: PoolHandle) {
        tokio::time::timeout(Duration::from_secs(600), handle.join())
            .await
            .expect("pool did not terminate");
    }

    #[tokio::test]
    async fn test_pool_runs_shard_to_completion() {
        let recorder = Arc::new(RecordingTracker::default());
        let pool = DevicePoolActor::spawn(DevicePoolId::new("omni"), context(recorder.clone()));
        let d1 = FakeDevice::new("d1", Behavior::Report(TestStatus::Passed));
        let d2 = FakeDevice::new("d2", Behavior::Report(TestStatus::Passed));
        let disposed = [d1.disposed.clone(), d2.disposed.clone()];

        let tests: Vec<Test> = (0..5).map(|i| test(&format!("t{}", i))).collect();
        pool.send(PoolMessage::AddShard(TestShard::new(tests))).await.unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(d1))).await.unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(d2))).await.unwrap();
        join(pool).await;

        let finals = recorder.finals();
        assert_eq!(finals.len(), 5);
        assert!(finals.iter().all(|r| r.status == TestStatus::Passed));
        for counter in disposed {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_removed_device_work_moves_to_another_device() {
        let recorder = Arc::new(RecordingTracker::default());
        let pool = DevicePoolActor::spawn(DevicePoolId::new("omni"), context(recorder.clone()));
        let hanging = FakeDevice::new("hanging", Behavior::Hang);
        let executed = hanging.executed.clone();

        pool.send(PoolMessage::AddShard(TestShard::new(vec![test("a")])))
            .await
            .unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(hanging))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executed.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let healthy = FakeDevice::new("healthy", Behavior::Report(TestStatus::Passed));
        pool.send(PoolMessage::AddDevice(Box::new(healthy))).await.unwrap();
        pool.send(PoolMessage::RemoveDevice("hanging".into())).await.unwrap();
        join(pool).await;

        let finals = recorder.finals();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, TestStatus::Passed);
        assert_eq!(finals[0].device.serial_number, "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timer_terminates_deviceless_pool() {
        let recorder = Arc::new(RecordingTracker::default());
        let pool = DevicePoolActor::spawn(DevicePoolId::new("omni"), context(recorder.clone()));
        let start = Instant::now();

        pool.send(PoolMessage::AddShard(TestShard::new(vec![test("a")])))
            .await
            .unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(FakeDevice::new("d1", Behavior::Hang))))
            .await
            .unwrap();
        pool.send(PoolMessage::RemoveDevice("d1".into())).await.unwrap();
        pool.send(PoolMessage::DevicesExhausted).await.unwrap();
        join(pool).await;

        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(recorder.finals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_device_disarms_grace_timer() {
        let recorder = Arc::new(RecordingTracker::default());
        let pool = DevicePoolActor::spawn(DevicePoolId::new("omni"), context(recorder.clone()));

        pool.send(PoolMessage::AddShard(TestShard::new(vec![test("a")])))
            .await
            .unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(FakeDevice::new("d1", Behavior::Hang))))
            .await
            .unwrap();
        pool.send(PoolMessage::DevicesExhausted).await.unwrap();
        pool.send(PoolMessage::RemoveDevice("d1".into())).await.unwrap();
        pool.send(PoolMessage::AddDevice(Box::new(FakeDevice::new(
            "d2",
            Behavior::Report(TestStatus::Passed),
        ))))
        .await
        .unwrap();
        join(pool).await;

        let finals = recorder.finals();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_duplicate_device_is_ignored() {
        #[derive(Default)]
        struct Connections(AtomicUsize);

        impl Tracker for Connections {
            fn device_connected(&self, _pool: &DevicePoolId, _device: &DeviceInfo) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let connections = Arc::new(Connections::default());
        let ctx = context(Arc::new(RecordingTracker::default()));
        ctx.track.register_arc(connections.clone());
        let (self_tx, _self_rx) = mpsc::channel(16);
        let (queue_tx, _queue_rx) = mpsc::channel(16);
        let mut pool = DevicePoolActor::new(DevicePoolId::new("omni"), ctx, self_tx, queue_tx);

        for _ in 0..2 {
            let device = FakeDevice::new("d1", Behavior::Report(TestStatus::Passed));
            assert!(pool.handle(PoolMessage::AddDevice(Box::new(device))).await);
        }

        assert_eq!(pool.device_count(), 1);
        assert_eq!(connections.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_device_prefers_other_idle_devices() {
        let ctx = context(Arc::new(RecordingTracker::default()));
        let (self_tx, mut self_rx) = mpsc::channel(16);
        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let mut pool = DevicePoolActor::new(DevicePoolId::new("omni"), ctx, self_tx, queue_tx);

        for serial in ["d1", "d2", "d3"] {
            let device = FakeDevice::new(serial, Behavior::Report(TestStatus::Passed));
            pool.handle(PoolMessage::AddDevice(Box::new(device))).await;
            // wait for the worker's DeviceReady
            let Some(PoolMessage::DeviceReady(info)) = self_rx.recv().await else {
                panic!("expected DeviceReady");
            };
            pool.handle(PoolMessage::DeviceReady(info.clone())).await;

            let Some(QueueMessage::RequestBatch(requested)) = queue_rx.recv().await else {
                panic!("expected RequestBatch");
            };
            if serial == "d1" {
                // sole idle device falls back to itself
                assert_eq!(requested.serial_number, "d1");
            } else {
                assert_ne!(requested.serial_number, serial);
            }
            pool.handle(PoolMessage::NoWork(requested)).await;
        }
    }

    #[tokio::test]
    async fn test_busy_device_is_freed_by_its_results() {
        let ctx = context(Arc::new(RecordingTracker::default()));
        let (self_tx, mut self_rx) = mpsc::channel(16);
        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let mut pool = DevicePoolActor::new(DevicePoolId::new("omni"), ctx, self_tx, queue_tx);

        let device = FakeDevice::new("d1", Behavior::Hang);
        pool.handle(PoolMessage::AddDevice(Box::new(device))).await;
        let Some(PoolMessage::DeviceReady(info)) = self_rx.recv().await else {
            panic!("expected DeviceReady");
        };
        pool.handle(PoolMessage::DeviceReady(info.clone())).await;
        assert!(matches!(queue_rx.try_recv(), Ok(QueueMessage::RequestBatch(_))));

        let batch = TestBatch::from_tests(vec![test("a")]).unwrap();
        pool.handle(PoolMessage::ExecuteBatch(info.clone(), batch.clone()))
            .await;
        assert_eq!(pool.workers["d1"].status, WorkerStatus::Busy);

        // a wake-up answered before the batch arrived
        pool.handle(PoolMessage::DeviceReady(info.clone())).await;
        assert_eq!(pool.workers["d1"].status, WorkerStatus::Busy);
        assert!(queue_rx.try_recv().is_err());

        let results = TestBatchResults::all_uncompleted(&batch, &info, "lost");
        pool.handle(PoolMessage::CompletedTestBatch(info.clone(), results))
            .await;
        assert!(matches!(queue_rx.try_recv(), Ok(QueueMessage::Completed(..))));
        assert_eq!(pool.workers["d1"].status, WorkerStatus::Idle);

        pool.handle(PoolMessage::DeviceReady(info)).await;
        assert!(matches!(queue_rx.try_recv(), Ok(QueueMessage::RequestBatch(d)) if d.serial_number == "d1"));
    }

    #[tokio::test]
    async fn test_batch_for_unknown_device_is_returned() {
        let ctx = context(Arc::new(RecordingTracker::default()));
        let (self_tx, _self_rx) = mpsc::channel(16);
        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let mut pool = DevicePoolActor::new(DevicePoolId::new("omni"), ctx, self_tx, queue_tx);

        let batch = TestBatch::from_tests(vec![test("a")]).unwrap();
        pool.handle(PoolMessage::ExecuteBatch(DeviceInfo::new("ghost"), batch.clone()))
            .await;

        match queue_rx.recv().await {
            Some(QueueMessage::ReturnBatch(device, returned)) => {
                assert_eq!(device.serial_number, "ghost");
                assert_eq!(returned.id, batch.id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_forwards_to_queue_once() {
        let ctx = context(Arc::new(RecordingTracker::default()));
        let (self_tx, _self_rx) = mpsc::channel(16);
        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let mut pool = DevicePoolActor::new(DevicePoolId::new("omni"), ctx, self_tx, queue_tx);

        pool.handle(PoolMessage::RequestStop).await;
        pool.handle(PoolMessage::RequestStop).await;

        assert!(matches!(queue_rx.try_recv(), Ok(QueueMessage::Stop)));
        assert!(queue_rx.try_recv().is_err());
        assert!(pool.is_grace_timer_armed());
        assert!(!pool.handle(PoolMessage::QueueTerminated).await);
    }
}
