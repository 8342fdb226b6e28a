// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound message routing and the command handler chain.

use std::sync::Arc;

use crate::model::{Command, CommandOutcome, Device, NodeSnapshot, PropertySnapshot};
use crate::protocol::{Inbound, InboundHandler, Topics};

/// Builds the inbound handler given to the transport.
///
/// The handler holds the device weakly, so a transport outliving its device
/// does not keep the device alive.
pub(crate) fn router(device: &Device) -> InboundHandler {
    let weak = device.downgrade();
    let topics = device.topics();
    Arc::new(move |topic: &str, payload: &[u8]| {
        if let Some(device) = weak.upgrade() {
            route(&device, &topics, topic, payload);
        }
    })
}

fn route(device: &Device, topics: &Topics, topic: &str, payload: &[u8]) {
    let Ok(payload) = std::str::from_utf8(payload) else {
        tracing::debug!(topic = %topic, "Ignoring non-UTF-8 payload");
        return;
    };

    match topics.parse(topic) {
        Some(Inbound::Set { node, property }) => {
            dispatch(device, node, property, payload);
        }
        Some(Inbound::Broadcast { level }) => match device.settings().broadcast_handler {
            Some(handler) => handler(level, payload),
            None => tracing::debug!(level = %level, "Ignoring broadcast without handler"),
        },
        None => tracing::debug!(topic = %topic, "Ignoring unexpected topic"),
    }
}

/// Runs the handler chain for a `/set` command: device, then node, then
/// property handler, stopping at the first that claims it. An `Update`
/// outcome is queued for the run loop.
pub(crate) fn dispatch(device: &Device, node: &str, property: &str, payload: &str) -> CommandOutcome {
    let Some((node_snapshot, property_snapshot, handlers)) = resolve(device, node, property)
    else {
        return CommandOutcome::Unhandled;
    };

    let command = Command {
        device_id: device.id(),
        node: &node_snapshot,
        property: &property_snapshot,
        payload,
    };
    let outcome = handlers
        .iter()
        .map(|handler| handler(&command))
        .find(CommandOutcome::is_claimed)
        .unwrap_or(CommandOutcome::Unhandled);

    match &outcome {
        CommandOutcome::Update(value) => {
            let queued = device
                .node(node)
                .and_then(|n| n.property(property))
                .map(|p| p.message().try_send(value.as_str()));
            if let Some(Err(e)) = queued {
                tracing::warn!(node = %node, property = %property, error = %e, "Dropping command update");
            }
        }
        CommandOutcome::Handled => {}
        CommandOutcome::Unhandled => {
            tracing::debug!(node = %node, property = %property, payload = %payload, "Command not handled");
        }
    }
    outcome
}

type Chain = Vec<crate::model::CommandHandler>;

/// Snapshots the target and collects its handler chain. No lock is held
/// once this returns, so handlers may freely read the device.
fn resolve(
    device: &Device,
    node: &str,
    property: &str,
) -> Option<(NodeSnapshot, PropertySnapshot, Chain)> {
    let global = device.settings().global_handler;
    let tree = device.tree().read();

    let Some(node_spec) = tree.nodes.get(node) else {
        tracing::debug!(node = %node, "Command for unknown node");
        return None;
    };
    let Some(property_spec) = node_spec.properties.get(property) else {
        tracing::debug!(node = %node, property = %property, "Command for unknown property");
        return None;
    };
    if !property_spec.settable {
        tracing::debug!(node = %node, property = %property, "Command for read-only property");
        return None;
    }

    let chain: Chain = [
        global,
        node_spec.handler.clone(),
        property_spec.handler.clone(),
    ]
    .into_iter()
    .flatten()
    .collect();

    Some((
        node_spec.snapshot(node),
        property_spec.snapshot(property),
        chain,
    ))
}
