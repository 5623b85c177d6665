//! Pooling strategies: which pool a newly connected device joins.

use crate::model::{DeviceInfo, DevicePoolId};

/// Maps a device to the pool it belongs to.
pub trait PoolingStrategy: Send + Sync {
    fn pool_for(&self, device: &DeviceInfo) -> DevicePoolId;
}

/// Puts every device into a single pool named `omni`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OmniPoolingStrategy;

impl PoolingStrategy for OmniPoolingStrategy {
    fn pool_for(&self, _device: &DeviceInfo) -> DevicePoolId {
        DevicePoolId::new("omni")
    }
}

/// Device snapshot field used to group devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttribute {
    Model,
    OperatingSystem,
    Manufacturer,
    Abi,
}

/// Groups devices sharing the same value of one attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttributePoolingStrategy {
    attribute: DeviceAttribute,
}

impl AttributePoolingStrategy {
    pub fn new(attribute: DeviceAttribute) -> Self {
        Self { attribute }
    }
}

impl PoolingStrategy for AttributePoolingStrategy {
    fn pool_for(&self, device: &DeviceInfo) -> DevicePoolId {
        let value = match self.attribute {
            DeviceAttribute::Model => &device.model,
            DeviceAttribute::OperatingSystem => &device.operating_system,
            DeviceAttribute::Manufacturer => &device.manufacturer,
            DeviceAttribute::Abi => &device.abi,
        };
        DevicePoolId::new(value.clone())
    }
}
