//! Inbox message types of the pool actors.

use std::fmt;

use tokio::sync::oneshot;

use crate::model::{Device, DeviceInfo, TestBatch, TestBatchResults, TestShard};

/// Messages handled by a [`DevicePoolActor`](super::DevicePoolActor).
pub enum PoolMessage {
    // From the scheduler.
    AddDevice(Box<dyn Device>),
    RemoveDevice(String),
    AddShard(TestShard),
    /// The device provider will not connect any more devices.
    DevicesExhausted,
    RequestStop,

    // From device workers.
    DeviceReady(DeviceInfo),
    DeviceTerminated(DeviceInfo),
    CompletedTestBatch(DeviceInfo, TestBatchResults),
    ReturnTestBatch(DeviceInfo, TestBatch),

    // From the queue.
    Notify,
    NoWork(DeviceInfo),
    ExecuteBatch(DeviceInfo, TestBatch),
    QueueTerminated,
}

impl fmt::Debug for PoolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMessage::AddDevice(device) => write!(f, "AddDevice({})", device.serial_number()),
            PoolMessage::RemoveDevice(serial) => write!(f, "RemoveDevice({})", serial),
            PoolMessage::AddShard(shard) => write!(f, "AddShard({} tests)", shard.executions()),
            PoolMessage::DevicesExhausted => f.write_str("DevicesExhausted"),
            PoolMessage::RequestStop => f.write_str("RequestStop"),
            PoolMessage::DeviceReady(d) => write!(f, "DeviceReady({})", d.serial_number),
            PoolMessage::DeviceTerminated(d) => write!(f, "DeviceTerminated({})", d.serial_number),
            PoolMessage::CompletedTestBatch(d, r) => {
                write!(f, "CompletedTestBatch({}, {})", d.serial_number, r.batch_id)
            }
            PoolMessage::ReturnTestBatch(d, b) => {
                write!(f, "ReturnTestBatch({}, {})", d.serial_number, b.id)
            }
            PoolMessage::Notify => f.write_str("Notify"),
            PoolMessage::NoWork(d) => write!(f, "NoWork({})", d.serial_number),
            PoolMessage::ExecuteBatch(d, b) => write!(f, "ExecuteBatch({}, {})", d.serial_number, b.id),
            PoolMessage::QueueTerminated => f.write_str("QueueTerminated"),
        }
    }
}

/// Messages handled by a [`QueueActor`](super::QueueActor).
#[derive(Debug)]
pub enum QueueMessage {
    AddShard(TestShard),
    RequestBatch(DeviceInfo),
    Completed(DeviceInfo, TestBatchResults),
    ReturnBatch(DeviceInfo, TestBatch),
    /// Replies true iff nothing is pending or active.
    IsEmpty(oneshot::Sender<bool>),
    Stop,
}

/// Events handled by a [`DeviceActor`](super::DeviceActor).
#[derive(Debug)]
pub enum DeviceEvent {
    Initialize,
    Execute(TestBatch),
    WakeUp,
    Terminate,
}
