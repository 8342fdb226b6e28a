// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::device::Device;
use crate::error::ConfigError;
use crate::validate::validate;

/// Registry of devices keyed by id.
///
/// The registry is owned by the hosting process and cheap to clone; all
/// clones share the same devices. Registering an id twice is an error,
/// never a silent overwrite.
///
/// # Examples
///
/// ```
/// use homie_runtime::model::DeviceRegistry;
///
/// let registry = DeviceRegistry::new();
/// let device = registry.create_device("Living-Room", "Living Room").unwrap();
/// assert_eq!(device.id(), "living-room");
/// assert!(registry.create_device("living-room", "Again").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a device in state `init`.
    ///
    /// The id is validated and lowercased.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidIdentifier`] for an invalid id,
    /// [`ConfigError::DuplicateDevice`] if the id is taken.
    pub fn create_device(&self, id: &str, name: impl Into<String>) -> Result<Device, ConfigError> {
        let id = validate(id, false)?;
        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(ConfigError::DuplicateDevice(id));
        }

        let device = Device::new(id.clone(), name.into());
        devices.insert(id.clone(), device.clone());
        tracing::debug!(device = %id, "Device registered");
        Ok(device)
    }

    /// Returns the device with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Device> {
        let id = validate(id, false).ok()?;
        self.devices.read().get(&id).cloned()
    }

    /// Unregisters a device and returns it.
    ///
    /// A running device keeps running until its cancellation token fires;
    /// removal only frees the id.
    pub fn remove(&self, id: &str) -> Option<Device> {
        let id = validate(id, false).ok()?;
        let removed = self.devices.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(device = %id, "Device unregistered");
        }
        removed
    }

    /// Returns whether a device with the given id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Returns all registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
