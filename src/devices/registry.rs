//! Case-insensitive registry of served devices.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::DeviceImpl;
use crate::error::DsError;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Arc<DeviceImpl>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Arc<DeviceImpl>) {
        self.devices
            .write()
            .insert(device.name().to_lowercase(), device);
    }

    pub fn get(&self, name: &str) -> Result<Arc<DeviceImpl>, DsError> {
        self.devices
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| DsError::DeviceNotFound(name.to_string()))
    }

    /// Every device, ordered by lower-cased name.
    pub fn all(&self) -> Vec<Arc<DeviceImpl>> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
