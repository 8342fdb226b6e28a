// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device → node → property tree.
//!
//! The tree is owned top-down by the [`Device`]. [`Node`] and [`Property`]
//! are non-owning handles made of the device handle plus stable ids, so a
//! property reaches its node and device by lookup rather than through back
//! pointers.
//!
//! The tree is write-once-then-frozen: nodes, properties, units, formats and
//! handlers can only be registered until [`Device::run`] starts. After that
//! every registration call fails with
//! [`ConfigError::ConfigFrozen`](crate::error::ConfigError::ConfigFrozen),
//! and property values change only through the run loop's publish queue.
//!
//! # Examples
//!
//! ```
//! use homie_runtime::model::{CommandOutcome, DeviceRegistry};
//! use homie_runtime::types::{Datatype, Unit};
//!
//! # fn example() -> homie_runtime::Result<()> {
//! let registry = DeviceRegistry::new();
//! let device = registry.create_device("kitchen-sensor", "Kitchen Sensor")?;
//!
//! let node = device.new_node("climate", "Climate", "sensor")?;
//! let temperature = node.advertise("temperature", "Temperature", Datatype::Float)?;
//! temperature.set_unit("°C")?;
//!
//! let target = node.advertise("target", "Target", Datatype::Float)?;
//! target.settable(|cmd| CommandOutcome::Update(cmd.payload.to_string()))?;
//! # Ok(())
//! # }
//! ```

mod command;
mod device;
mod node;
mod property;
mod registry;

pub use command::{BroadcastHandler, Command, CommandHandler, CommandOutcome};
pub use device::{
    DEFAULT_TOPIC_BASE, Device, HOMIE_VERSION, IMPLEMENTATION, WeakDevice,
};
pub use node::{Node, NodeSnapshot};
pub use property::{Property, PropertyMessage, PropertySnapshot};
pub use registry::DeviceRegistry;

pub(crate) use device::DeviceSettings;
pub(crate) use property::Outbound;

use std::collections::BTreeMap;

use crate::types::{Datatype, Unit};

/// Structural data of a device. Sorted maps give a stable announcement
/// order regardless of registration order.
#[derive(Default)]
pub(crate) struct DeviceTree {
    pub nodes: BTreeMap<String, NodeSpec>,
}

pub(crate) struct NodeSpec {
    pub name: String,
    pub node_type: String,
    pub handler: Option<CommandHandler>,
    pub properties: BTreeMap<String, PropertySpec>,
}

pub(crate) struct PropertySpec {
    pub name: String,
    pub datatype: Datatype,
    pub unit: Option<Unit>,
    pub format: Option<String>,
    pub settable: bool,
    pub handler: Option<CommandHandler>,
    pub value: String,
}

impl NodeSpec {
    pub(crate) fn snapshot(&self, id: &str) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            name: self.name.clone(),
            node_type: self.node_type.clone(),
        }
    }
}

impl PropertySpec {
    pub(crate) fn snapshot(&self, id: &str) -> PropertySnapshot {
        PropertySnapshot {
            id: id.to_string(),
            name: self.name.clone(),
            datatype: self.datatype,
            unit: self.unit,
            format: self.format.clone(),
            settable: self.settable,
            value: self.value.clone(),
        }
    }
}

impl DeviceTree {
    pub(crate) fn property(&self, node: &str, property: &str) -> Option<&PropertySpec> {
        self.nodes.get(node)?.properties.get(property)
    }

    pub(crate) fn property_mut(&mut self, node: &str, property: &str) -> Option<&mut PropertySpec> {
        self.nodes.get_mut(node)?.properties.get_mut(property)
    }
}
