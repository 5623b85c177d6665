//! Core data model shared by every actor of a run.
//!
//! All types in this module are plain values: they are created once
//! (during test discovery, batching, or execution) and are safe to move
//! across task boundaries. The only exception is [`Device`], the live
//! handle owned exclusively by its device worker; everything else refers
//! to devices through the serializable [`DeviceInfo`] snapshot.
//!
//! ```text
//!  Test ──► TestShard ──► pending ──► TestBatch ──► Device::execute
//!                                                        │
//!                                                        ▼
//!                                 TestBatchResults ◄── Vec<TestResult>
//! ```

pub mod batch;
pub mod device;
pub mod result;

pub use batch::{BatchError, TestBatch, TestShard};
pub use device::{Device, DeviceError, DeviceFeature, DeviceInfo, DevicePoolId, DeviceResult};
pub use result::{Attachment, AttachmentType, TestBatchResults, TestResult, TestStatus};
pub use test::{ComponentInfo, MetaProperty, Test};
