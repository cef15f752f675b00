//! Device registry
//!
//! Maps wire device numbers to logical device ids for one port. The mapping is
//! a bijection: a device number belongs to at most one id and an id holds
//! exactly one number. Guarded separately from the command queue so
//! registration never stalls command execution.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registration record of a logical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// Logical id
    pub device_id: String,
    /// Wire address
    pub device_number: u8,
    /// Discovered or configured channel count; `None` until known
    pub channel_count: Option<u8>,
}

impl VirtualDevice {
    /// New record with an unknown channel count
    pub fn new(device_id: impl Into<String>, device_number: u8) -> Self {
        Self {
            device_id: device_id.into(),
            device_number,
            channel_count: None,
        }
    }
}

/// Snapshot of a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registered device ids, sorted
    pub devices: Vec<String>,
    /// Device number to device id
    pub device_numbers: BTreeMap<u8, String>,
    /// Whether the owning port is connected
    pub connected: bool,
}

/// Why [`DeviceRegistry::register_new`] refused a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationConflict {
    /// The id is already registered
    IdTaken,
    /// The number belongs to the contained id
    NumberTaken(String),
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, VirtualDevice>,
    by_number: HashMap<u8, String>,
}

/// Device registry for one port
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a device.
    ///
    /// Returns false, leaving the registry untouched, when the device number
    /// already belongs to a different id. Re-registering an id moves it to the
    /// new number.
    pub fn register(&self, device: VirtualDevice) -> bool {
        let mut inner = self.write();
        if let Some(owner) = inner.by_number.get(&device.device_number) {
            if owner != &device.device_id {
                tracing::warn!(
                    device_number = device.device_number,
                    existing = %owner,
                    rejected = %device.device_id,
                    "device number already registered"
                );
                return false;
            }
        }

        if let Some(previous) = inner.by_id.get(&device.device_id) {
            let old_number = previous.device_number;
            inner.by_number.remove(&old_number);
        }
        inner
            .by_number
            .insert(device.device_number, device.device_id.clone());
        tracing::debug!(
            device_id = %device.device_id,
            device_number = device.device_number,
            "device registered"
        );
        inner.by_id.insert(device.device_id.clone(), device);
        true
    }

    /// Register a device whose id must not be registered yet.
    ///
    /// Both checks happen under one write lock, so two callers racing with the
    /// same id cannot both succeed.
    pub fn register_new(&self, device: VirtualDevice) -> Result<(), RegistrationConflict> {
        let mut inner = self.write();
        if inner.by_id.contains_key(&device.device_id) {
            return Err(RegistrationConflict::IdTaken);
        }
        if let Some(owner) = inner.by_number.get(&device.device_number) {
            tracing::warn!(
                device_number = device.device_number,
                existing = %owner,
                rejected = %device.device_id,
                "device number already registered"
            );
            return Err(RegistrationConflict::NumberTaken(owner.clone()));
        }
        inner
            .by_number
            .insert(device.device_number, device.device_id.clone());
        tracing::debug!(
            device_id = %device.device_id,
            device_number = device.device_number,
            "device registered"
        );
        inner.by_id.insert(device.device_id.clone(), device);
        Ok(())
    }

    /// Remove a device and its number mapping
    pub fn unregister(&self, device_id: &str) -> Option<VirtualDevice> {
        let mut inner = self.write();
        let device = inner.by_id.remove(device_id)?;
        if inner.by_number.get(&device.device_number).map(String::as_str) == Some(device_id) {
            inner.by_number.remove(&device.device_number);
        }
        tracing::debug!(device_id, device_number = device.device_number, "device unregistered");
        Some(device)
    }

    /// Record for `device_id`
    pub fn get(&self, device_id: &str) -> Option<VirtualDevice> {
        self.read().by_id.get(device_id).cloned()
    }

    /// Id registered for a device number
    pub fn device_id_for(&self, device_number: u8) -> Option<String> {
        self.read().by_number.get(&device_number).cloned()
    }

    /// Record a device's channel count. Returns false for unknown ids.
    pub fn set_channel_count(&self, device_id: &str, channel_count: u8) -> bool {
        match self.write().by_id.get_mut(device_id) {
            Some(device) => {
                device.channel_count = Some(channel_count);
                true
            }
            None => false,
        }
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Snapshot for statistics
    pub fn stats(&self, connected: bool) -> RegistryStats {
        let inner = self.read();
        let mut devices: Vec<String> = inner.by_id.keys().cloned().collect();
        devices.sort();
        RegistryStats {
            devices,
            device_numbers: inner
                .by_number
                .iter()
                .map(|(number, id)| (*number, id.clone()))
                .collect(),
            connected,
        }
    }
}
