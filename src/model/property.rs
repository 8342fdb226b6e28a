// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property handle and value updates.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;

use super::command::{Command, CommandHandler, CommandOutcome};
use super::device::Device;
use crate::error::{ConfigError, Error};
use crate::types::{Datatype, Unit};

/// Read-only view of a property, handed to command handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySnapshot {
    /// Property id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Payload type.
    pub datatype: Datatype,
    /// Unit, if any.
    pub unit: Option<Unit>,
    /// Format hint, e.g. `0:100` or `on,off`.
    pub format: Option<String>,
    /// Whether the property accepts commands.
    pub settable: bool,
    /// Last-known value.
    pub value: String,
}

/// A value update waiting in the publish queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub node: String,
    pub property: String,
    pub value: String,
}

/// Handle to a property of a node.
#[derive(Debug, Clone)]
pub struct Property {
    device: Device,
    node_id: String,
    id: String,
}

impl Property {
    pub(crate) fn new(device: Device, node_id: String, id: String) -> Self {
        Self {
            device,
            node_id,
            id,
        }
    }

    /// Returns the property id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the id of the owning node.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the owning device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the last-known value.
    #[must_use]
    pub fn value(&self) -> String {
        self.device
            .tree()
            .read()
            .property(&self.node_id, &self.id)
            .map(|spec| spec.value.clone())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the property, or `None` if it no longer exists.
    #[must_use]
    pub fn snapshot(&self) -> Option<PropertySnapshot> {
        self.device
            .tree()
            .read()
            .property(&self.node_id, &self.id)
            .map(|spec| spec.snapshot(&self.id))
    }

    /// Marks the property settable and registers its command handler, the
    /// last one consulted in the dispatch chain.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn settable<F>(&self, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&Command<'_>) -> CommandOutcome + Send + Sync + 'static,
    {
        let handler: CommandHandler = Arc::new(handler);
        self.configure("settable", |spec| {
            spec.settable = true;
            spec.handler = Some(handler);
        })
    }

    /// Sets the unit announced on `$unit`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidUnit`] outside the allow-list,
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_unit(&self, unit: &str) -> Result<(), ConfigError> {
        let unit: Unit = unit.parse()?;
        self.configure("unit", |spec| spec.unit = Some(unit))
    }

    /// Sets the format hint announced on `$format`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_format(&self, format: impl Into<String>) -> Result<(), ConfigError> {
        let format = format.into();
        self.configure("format", |spec| spec.format = Some(format))
    }

    /// Starts a value update for this property.
    #[must_use]
    pub fn message(&self) -> PropertyMessage {
        PropertyMessage {
            property: self.clone(),
        }
    }

    fn configure(
        &self,
        what: &str,
        apply: impl FnOnce(&mut super::PropertySpec),
    ) -> Result<(), ConfigError> {
        let mut tree = self.device.tree().write();
        self.device
            .ensure_configurable(&format!("{}/{} {what}", self.node_id, self.id))?;
        let spec = tree
            .property_mut(&self.node_id, &self.id)
            .ok_or_else(|| ConfigError::Unknown {
                kind: "property",
                id: format!("{}/{}", self.node_id, self.id),
            })?;
        apply(spec);
        Ok(())
    }

    /// Writes the value directly while the device is still being set up.
    ///
    /// Returns the value back once the device runs, so it can be queued.
    fn store_if_configuring(&self, value: String) -> Option<String> {
        let mut tree = self.device.tree().write();
        if self.device.is_frozen() {
            return Some(value);
        }
        if let Some(spec) = tree.property_mut(&self.node_id, &self.id) {
            spec.value = value;
        }
        None
    }

    fn outbound(&self, value: String) -> Outbound {
        Outbound {
            node: self.node_id.clone(),
            property: self.id.clone(),
            value,
        }
    }
}

/// A pending value update for one property.
///
/// Created by [`Property::message`] and consumed by
/// [`send`](Self::send) or [`try_send`](Self::try_send). Before the device
/// runs, the value is stored directly and announced with the rest of the
/// tree. Afterwards, it is queued for the run loop, which stores and
/// publishes it retained at QoS 1.
#[derive(Debug, Clone)]
#[must_use = "a property message does nothing until sent"]
pub struct PropertyMessage {
    property: Property,
}

impl PropertyMessage {
    /// Sends the value, waiting for room in the publish queue.
    ///
    /// # Errors
    ///
    /// [`Error::QueueClosed`] if the device's run loop has finished.
    pub async fn send(self, value: impl Into<String>) -> Result<(), Error> {
        let Some(value) = self.property.store_if_configuring(value.into()) else {
            return Ok(());
        };
        let outbound = self.property.outbound(value);
        self.property
            .device
            .publish_sender()
            .send(outbound)
            .await
            .map_err(|_| Error::QueueClosed(self.property.device.id().to_string()))
    }

    /// Sends the value without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] when the publish queue is saturated,
    /// [`Error::QueueClosed`] if the device's run loop has finished.
    pub fn try_send(self, value: impl Into<String>) -> Result<(), Error> {
        let Some(value) = self.property.store_if_configuring(value.into()) else {
            return Ok(());
        };
        let outbound = self.property.outbound(value);
        let device_id = self.property.device.id().to_string();
        self.property
            .device
            .publish_sender()
            .try_send(outbound)
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::QueueFull(device_id),
                TrySendError::Closed(_) => Error::QueueClosed(device_id),
            })
    }
}
