// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device tree to publication list.
//!
//! Everything here is pure: the same device and uptime always produce the
//! same publications in the same order, which is what makes reconnect
//! republication idempotent.

use std::time::Duration;

use super::{Publication, Topics};
use crate::model::{Device, DeviceSettings, HOMIE_VERSION, IMPLEMENTATION};
use crate::types::{DeviceState, Extension};

/// Returns the `$state` publication.
#[must_use]
pub fn state(topics: &Topics, state: DeviceState) -> Publication {
    Publication::retained(topics.device("$state"), state.as_str())
}

/// Returns the `$stats/uptime` publication, in whole seconds.
#[must_use]
pub fn uptime(topics: &Topics, uptime: Duration) -> Publication {
    Publication::retained(topics.device("$stats/uptime"), uptime.as_secs().to_string())
}

/// Returns the retained publications describing `device`, in announcement
/// order: device attributes, `$nodes`, then every node followed by its
/// properties. Nodes and properties are sorted by id.
///
/// `$state` is not included; the connection lifecycle brackets this list
/// with `init` and `ready`.
#[must_use]
pub fn announcement(device: &Device, uptime_now: Duration) -> Vec<Publication> {
    let topics = device.topics();
    let settings = device.settings();
    let tree = device.tree().read();

    let mut publications = device_attributes(device, &topics, &settings, uptime_now);

    let node_ids: Vec<&str> = tree.nodes.keys().map(String::as_str).collect();
    publications.push(Publication::retained(
        topics.device("$nodes"),
        node_ids.join(","),
    ));

    for (node_id, node) in &tree.nodes {
        let property_ids: Vec<&str> = node.properties.keys().map(String::as_str).collect();
        publications.push(Publication::retained(
            topics.node(node_id, "$name"),
            node.name.as_str(),
        ));
        publications.push(Publication::retained(
            topics.node(node_id, "$type"),
            node.node_type.as_str(),
        ));
        publications.push(Publication::retained(
            topics.node(node_id, "$properties"),
            property_ids.join(","),
        ));

        for (property_id, property) in &node.properties {
            let attr = |name: &str, value: &str| {
                Publication::retained(topics.property(node_id, property_id, name), value)
            };
            publications.push(attr("$name", &property.name));
            publications.push(attr("$datatype", property.datatype.as_str()));
            if let Some(format) = &property.format {
                publications.push(attr("$format", format));
            }
            if property.settable {
                publications.push(attr("$settable", "true"));
            }
            if let Some(unit) = property.unit {
                publications.push(attr("$unit", unit.as_str()));
            }
            publications.push(Publication::retained(
                topics.value(node_id, property_id),
                property.value.as_str(),
            ));
        }
    }

    publications
}

/// Returns the topic filters the device subscribes to: the `/set` topic of
/// every settable property and, with a broadcast handler registered, the
/// broadcast filter.
#[must_use]
pub fn subscriptions(device: &Device) -> Vec<String> {
    let topics = device.topics();
    let has_broadcast_handler = device.settings().broadcast_handler.is_some();
    let tree = device.tree().read();

    let mut filters: Vec<String> = tree
        .nodes
        .iter()
        .flat_map(|(node_id, node)| {
            node.properties
                .iter()
                .filter(|(_, property)| property.settable)
                .map(|(property_id, _)| topics.set(node_id, property_id))
        })
        .collect();

    if has_broadcast_handler {
        filters.push(topics.broadcast_filter());
    }
    filters
}

fn device_attributes(
    device: &Device,
    topics: &Topics,
    settings: &DeviceSettings,
    uptime_now: Duration,
) -> Vec<Publication> {
    vec![
        Publication::retained(topics.device("$homie"), HOMIE_VERSION),
        Publication::retained(topics.device("$name"), device.name()),
        Publication::retained(topics.device("$extensions"), Extension::announcement()),
        Publication::retained(topics.device("$implementation"), IMPLEMENTATION),
        Publication::retained(
            topics.device("$stats/interval"),
            settings.stats_interval.as_secs().to_string(),
        ),
        uptime(topics, uptime_now),
        Publication::retained(topics.device("$fw/name"), settings.firmware_name.as_str()),
        Publication::retained(
            topics.device("$fw/version"),
            settings.firmware_version.as_str(),
        ),
    ]
}
