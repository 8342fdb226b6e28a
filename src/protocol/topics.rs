// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Homie topic grammar.
//!
//! ```text
//! <base>/<device>/$state                     device attribute
//! <base>/<device>/<node>/$type               node attribute
//! <base>/<device>/<node>/<property>          property value
//! <base>/<device>/<node>/<property>/$unit    property attribute
//! <base>/<device>/<node>/<property>/set      inbound command
//! <base>/$broadcast/<level>                  inbound broadcast
//! ```

/// Topic builder and parser for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    device_id: String,
}

/// An inbound message the device reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A command for a property.
    Set {
        /// Target node id.
        node: &'a str,
        /// Target property id.
        property: &'a str,
    },
    /// A broadcast to all devices under the base topic.
    Broadcast {
        /// Everything after `$broadcast/`.
        level: &'a str,
    },
}

impl Topics {
    /// Creates the topic set for `device_id` under `base`.
    #[must_use]
    pub fn new(base: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            device_id: device_id.into(),
        }
    }

    /// Returns the topic base.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/<device>/<attr>`
    #[must_use]
    pub fn device(&self, attr: &str) -> String {
        format!("{}/{}/{attr}", self.base, self.device_id)
    }

    /// `<base>/<device>/<node>/<attr>`
    #[must_use]
    pub fn node(&self, node: &str, attr: &str) -> String {
        format!("{}/{}/{node}/{attr}", self.base, self.device_id)
    }

    /// `<base>/<device>/<node>/<property>`
    #[must_use]
    pub fn value(&self, node: &str, property: &str) -> String {
        self.node(node, property)
    }

    /// `<base>/<device>/<node>/<property>/<attr>`
    #[must_use]
    pub fn property(&self, node: &str, property: &str, attr: &str) -> String {
        format!("{}/{}/{node}/{property}/{attr}", self.base, self.device_id)
    }

    /// `<base>/<device>/<node>/<property>/set`
    #[must_use]
    pub fn set(&self, node: &str, property: &str) -> String {
        self.property(node, property, "set")
    }

    /// `<base>/$broadcast/#`
    #[must_use]
    pub fn broadcast_filter(&self) -> String {
        format!("{}/$broadcast/#", self.base)
    }

    /// Classifies an inbound topic.
    ///
    /// Returns `None` for anything that is neither a command addressed to
    /// this device nor a broadcast.
    #[must_use]
    pub fn parse<'a>(&self, topic: &'a str) -> Option<Inbound<'a>> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;

        if let Some(level) = rest.strip_prefix("$broadcast/") {
            return (!level.is_empty()).then_some(Inbound::Broadcast { level });
        }

        let rest = rest
            .strip_prefix(self.device_id.as_str())?
            .strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [node, property, "set"] if !node.is_empty() && !property.is_empty() => {
                Some(Inbound::Set { node, property })
            }
            _ => None,
        }
    }
}

/// Returns whether `topic` matches the subscription `filter`.
///
/// Supports the `+` single-level and trailing `#` multi-level wildcards.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
