//! Device worker.
//!
//! A [`DeviceActor`] owns one [`Device`] for its whole life and never holds
//! more than one batch: the only state in which it runs anything is
//! [`DeviceState::Executing`], and it only enters it from `Ready`.
//!
//! ```text
//! Uninitialized ─Initialize─▶ Initializing ─ok─▶ Ready ◀──▶ Executing
//!                                  │                 │
//!                                  └─err─▶ Terminated ◀─Terminate (any state)
//! ```
//!
//! Work is pulled: after every batch the worker reports `DeviceReady` and
//! waits for the pool to hand it the next one.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{DeviceEvent, PoolMessage};
use super::{DEVICE_INBOX_CAPACITY, ExecutionContext};
use crate::model::{
    Device, DeviceError, DeviceInfo, DevicePoolId, DeviceResult, TestBatch, TestBatchResults,
    TestResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Terminated,
}

/// The pool's side of a running worker.
pub struct DeviceHandle {
    info: DeviceInfo,
    sender: mpsc::Sender<DeviceEvent>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl DeviceHandle {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub async fn send(&self, event: DeviceEvent) -> Result<(), SendError<DeviceEvent>> {
        self.sender.send(event).await
    }

    /// Sends a `WakeUp` unless the inbox is full. Wake-ups are hints, so a
    /// busy worker may miss some.
    pub fn wake_up(&self) {
        if self.sender.try_send(DeviceEvent::WakeUp).is_err() {
            debug!("{} inbox is full, skipping wake-up", self.info.serial_number);
        }
    }

    /// Aborts whatever the worker is doing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the worker, asks it to terminate and waits until the device
    /// is disposed.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.sender.try_send(DeviceEvent::Terminate);
        drop(self.sender);
        if let Err(e) = self.join.await {
            error!("Device worker {} panicked: {}", self.info.serial_number, e);
        }
    }
}

/// Single-device actor.
pub struct DeviceActor {
    pool_id: DevicePoolId,
    device: Box<dyn Device>,
    info: DeviceInfo,
    state: DeviceState,
    pool: mpsc::Sender<PoolMessage>,
    ctx: ExecutionContext,
    token: CancellationToken,
    disposed: bool,
}

impl DeviceActor {
    pub fn new(
        pool_id: DevicePoolId,
        device: Box<dyn Device>,
        pool: mpsc::Sender<PoolMessage>,
        ctx: ExecutionContext,
        token: CancellationToken,
    ) -> Self {
        let info = device.info();
        Self {
            pool_id,
            device,
            info,
            state: DeviceState::Uninitialized,
            pool,
            ctx,
            token,
            disposed: false,
        }
    }

    /// Starts the worker on its own task.
    pub fn spawn(
        pool_id: DevicePoolId,
        device: Box<dyn Device>,
        pool: mpsc::Sender<PoolMessage>,
        ctx: ExecutionContext,
        token: CancellationToken,
    ) -> DeviceHandle {
        let (sender, inbox) = mpsc::channel(DEVICE_INBOX_CAPACITY);
        let actor = Self::new(pool_id, device, pool, ctx, token.clone());
        let info = actor.info.clone();
        DeviceHandle {
            info,
            sender,
            token,
            join: tokio::spawn(actor.run(inbox)),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Processes events until the pool drops its handle, then disposes the
    /// device if that has not happened yet.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event).await;
        }
        self.terminate().await;
    }

    pub async fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Initialize => self.initialize().await,
            DeviceEvent::Execute(batch) => self.execute(batch).await,
            DeviceEvent::WakeUp => {
                if self.state == DeviceState::Ready {
                    self.send(PoolMessage::DeviceReady(self.info.clone())).await;
                }
            }
            DeviceEvent::Terminate => self.terminate().await,
        }
    }

    async fn send(&self, message: PoolMessage) {
        if self.pool.send(message).await.is_err() {
            debug!("{} pool is gone, dropping message", self.info.serial_number);
        }
    }

    async fn initialize(&mut self) {
        if self.state != DeviceState::Uninitialized {
            warn!("{} is already {:?}, ignoring Initialize", self.info.serial_number, self.state);
            return;
        }
        self.state = DeviceState::Initializing;

        let track = self.ctx.track.clone();
        let token = self.token.clone();
        let serial = self.info.serial_number.clone();
        let device = &mut self.device;
        let prepared = track
            .track_device_preparing(&serial, async move {
                tokio::select! {
                    _ = token.cancelled() => Err(DeviceError::PrepareFailed("cancelled".to_string())),
                    result = device.prepare() => result,
                }
            })
            .await;

        match prepared {
            Ok(()) => {
                self.info = self.device.info();
                self.state = DeviceState::Ready;
                info!("[{}] {} is ready", self.pool_id, self.info);
                self.send(PoolMessage::DeviceReady(self.info.clone())).await;
            }
            Err(e) => {
                error!("[{}] failed to initialize {}: {}", self.pool_id, self.info, e);
                self.terminate().await;
                self.send(PoolMessage::DeviceTerminated(self.info.clone())).await;
            }
        }
    }

    async fn execute(&mut self, batch: TestBatch) {
        if self.state != DeviceState::Ready {
            warn!(
                "{} received batch {} while {:?}, returning it",
                self.info.serial_number, batch.id, self.state
            );
            self.send(PoolMessage::ReturnTestBatch(self.info.clone(), batch))
                .await;
            return;
        }
        self.state = DeviceState::Executing;

        for test in &batch.tests {
            self.ctx.progress.test_started(&self.pool_id, &self.info, test);
        }

        let message = match self.run_batch(&batch).await {
            Ok(results) => PoolMessage::CompletedTestBatch(
                self.info.clone(),
                TestBatchResults::partition(&batch, &self.info, results),
            ),
            Err(DeviceError::NotReady(reason)) => {
                warn!(
                    "[{}] {} could not start batch {}: {}",
                    self.pool_id, self.info.serial_number, batch.id, reason
                );
                PoolMessage::ReturnTestBatch(self.info.clone(), batch)
            }
            Err(e) => {
                error!(
                    "[{}] batch {} failed on {}: {}",
                    self.pool_id, batch.id, self.info.serial_number, e
                );
                PoolMessage::CompletedTestBatch(
                    self.info.clone(),
                    TestBatchResults::all_uncompleted(&batch, &self.info, &e.to_string()),
                )
            }
        };
        self.send(message).await;

        if self.token.is_cancelled() {
            self.terminate().await;
        } else {
            self.state = DeviceState::Ready;
            self.send(PoolMessage::DeviceReady(self.info.clone())).await;
        }
    }

    /// Runs the batch under the batch timeout and the cancellation token.
    async fn run_batch(&mut self, batch: &TestBatch) -> DeviceResult<Vec<TestResult>> {
        let timeout = self.ctx.run.test_batch_timeout();
        let track = self.ctx.track.clone();
        let token = self.token.clone();
        let serial = self.info.serial_number.clone();
        let device = &mut self.device;

        track
            .track_executing_batch(&serial, async move {
                tokio::select! {
                    _ = token.cancelled() => Err(DeviceError::Lost("worker cancelled".to_string())),
                    result = tokio::time::timeout(timeout, device.execute(batch)) => match result {
                        Ok(result) => result,
                        Err(_) => Err(DeviceError::Timeout(format!("batch exceeded {:?}", timeout))),
                    },
                }
            })
            .await
    }

    async fn terminate(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.device.dispose().await;
            debug!("[{}] {} disposed", self.pool_id, self.info.serial_number);
        }
        self.state = DeviceState::Terminated;
    }
}
