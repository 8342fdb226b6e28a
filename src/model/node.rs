// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node handle.

use std::sync::Arc;

use super::command::{Command, CommandHandler, CommandOutcome};
use super::device::Device;
use super::property::Property;
use super::PropertySpec;
use crate::error::ConfigError;
use crate::types::Datatype;
use crate::validate::validate;

/// Read-only view of a node, handed to command handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form node type, e.g. `relay`.
    pub node_type: String,
}

/// Handle to a node of a [`Device`].
#[derive(Debug, Clone)]
pub struct Node {
    device: Device,
    id: String,
}

impl Node {
    pub(crate) fn new(device: Device, id: String) -> Self {
        Self { device, id }
    }

    /// Returns the node id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the owning device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns a snapshot of the node, or `None` if it no longer exists.
    #[must_use]
    pub fn snapshot(&self) -> Option<NodeSnapshot> {
        let tree = self.device.tree().read();
        tree.nodes.get(&self.id).map(|spec| spec.snapshot(&self.id))
    }

    /// Adds a property.
    ///
    /// The property starts with an empty value, no unit or format, and is
    /// read-only until [`Property::settable`] is called.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidIdentifier`] if `id` is not a valid identifier
    /// - [`ConfigError::ConfigFrozen`] once the device runs
    /// - [`ConfigError::DuplicateProperty`] if the property exists
    pub fn advertise(
        &self,
        id: &str,
        name: impl Into<String>,
        datatype: Datatype,
    ) -> Result<Property, ConfigError> {
        let id = validate(id, false)?;
        let mut tree = self.device.tree().write();
        self.device.ensure_configurable(&format!("{}/{id}", self.id))?;

        let node = tree
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| unknown_node(&self.id))?;
        if node.properties.contains_key(&id) {
            return Err(ConfigError::DuplicateProperty {
                node: self.id.clone(),
                property: id,
            });
        }

        node.properties.insert(
            id.clone(),
            PropertySpec {
                name: name.into(),
                datatype,
                unit: None,
                format: None,
                settable: false,
                handler: None,
                value: String::new(),
            },
        );
        tracing::debug!(
            device = %self.device.id(),
            node = %self.id,
            property = %id,
            datatype = %datatype,
            "Property advertised"
        );

        Ok(Property::new(self.device.clone(), self.id.clone(), id))
    }

    /// Returns a handle to an existing property.
    #[must_use]
    pub fn property(&self, id: &str) -> Option<Property> {
        let id = validate(id, false).ok()?;
        let exists = self.device.tree().read().property(&self.id, &id).is_some();
        exists.then(|| Property::new(self.device.clone(), self.id.clone(), id))
    }

    /// Returns the ids of all properties, sorted.
    #[must_use]
    pub fn property_ids(&self) -> Vec<String> {
        self.device
            .tree()
            .read()
            .nodes
            .get(&self.id)
            .map(|node| node.properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers the node-level command handler, consulted after the
    /// device-level handler and before the property's own.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn on_command<F>(&self, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&Command<'_>) -> CommandOutcome + Send + Sync + 'static,
    {
        let handler: CommandHandler = Arc::new(handler);
        let mut tree = self.device.tree().write();
        self.device
            .ensure_configurable(&format!("{} handler", self.id))?;
        let node = tree
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| unknown_node(&self.id))?;
        node.handler = Some(handler);
        Ok(())
    }
}

fn unknown_node(id: &str) -> ConfigError {
    ConfigError::Unknown {
        kind: "node",
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        let device = Device::new("dev".to_string(), "Dev".to_string());
        device.new_node("outlet", "Outlet", "relay").unwrap()
    }

    #[test]
    fn snapshot_reflects_registration() {
        let node = node();
        assert_eq!(
            node.snapshot().unwrap(),
            NodeSnapshot {
                id: "outlet".to_string(),
                name: "Outlet".to_string(),
                node_type: "relay".to_string(),
            }
        );
    }

    #[test]
    fn advertise_adds_sorted_properties() {
        let node = node();
        node.advertise("power", "Power", Datatype::Float).unwrap();
        node.advertise("on", "On", Datatype::Boolean).unwrap();
        assert_eq!(node.property_ids(), vec!["on".to_string(), "power".to_string()]);
        assert!(node.property("ON").is_some());
        assert!(node.property("missing").is_none());
    }

    #[test]
    fn duplicate_property_rejected() {
        let node = node();
        node.advertise("on", "On", Datatype::Boolean).unwrap();
        assert_eq!(
            node.advertise("on", "Again", Datatype::String).unwrap_err(),
            ConfigError::DuplicateProperty {
                node: "outlet".to_string(),
                property: "on".to_string()
            }
        );
    }

    #[test]
    fn datatype_parsed_from_string() {
        let node = node();
        let datatype: Datatype = "integer".parse().unwrap();
        node.advertise("count", "Count", datatype).unwrap();
        assert!(matches!(
            "decimal".parse::<Datatype>(),
            Err(ConfigError::InvalidDatatype(_))
        ));
    }

    #[test]
    fn frozen_node_rejects_changes() {
        let node = node();
        let _rx = node.device().freeze().unwrap();
        assert!(matches!(
            node.advertise("on", "On", Datatype::Boolean),
            Err(ConfigError::ConfigFrozen(_))
        ));
        assert!(matches!(
            node.on_command(|_| CommandOutcome::Handled),
            Err(ConfigError::ConfigFrozen(_))
        ));
    }
}
