// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection lifecycle: announce on connect, retreat on loss, orderly
//! shutdown.

use std::time::Duration;

use super::session::Session;
use crate::error::TransportError;
use crate::model::Device;
use crate::protocol::{Transport, encoder};
use crate::types::DeviceState;

/// Publishes the whole tree after a (re)connect.
///
/// `init` is flushed before anything else and `ready` only after every
/// attribute and subscription is acknowledged, so observers never see a
/// ready device with a partial tree. If any step is not acknowledged the
/// announcement stops there: the device stays in `init`, not connected,
/// until the transport signals the next connect.
pub(crate) async fn announce<T: Transport>(
    device: &Device,
    session: &mut Session<T>,
    uptime: Duration,
) {
    // Whatever the previous connection left unacknowledged is moot now
    let _ = session.flush().await;

    tracing::info!(device = %device.id(), "Announcing device");
    device.set_connected(false);
    device.set_state(DeviceState::Init);

    if let Err(e) = publish_tree(device, session, uptime).await {
        tracing::warn!(device = %device.id(), error = %e, "Announcement incomplete");
        return;
    }

    device.set_connected(true);
    device.set_state(DeviceState::Ready);
}

async fn publish_tree<T: Transport>(
    device: &Device,
    session: &mut Session<T>,
    uptime: Duration,
) -> Result<(), TransportError> {
    let topics = device.topics();

    session
        .publish(encoder::state(&topics, DeviceState::Init))
        .await;
    session.flush().await?;

    for publication in encoder::announcement(device, uptime) {
        session.publish(publication).await;
    }
    for filter in encoder::subscriptions(device) {
        session.subscribe(&filter).await;
    }
    session.flush().await?;

    session
        .publish(encoder::state(&topics, DeviceState::Ready))
        .await;
    session.flush().await
}

/// Marks the device as not connected after the transport lost the session.
///
/// The tree and its values are kept for the next announcement.
pub(crate) fn connection_lost(device: &Device) {
    tracing::warn!(device = %device.id(), "Connection lost");
    device.set_connected(false);
    device.set_state(DeviceState::Init);
}

/// Publishes `disconnected` and releases the transport.
///
/// The orderly disconnect makes the broker discard the last will.
pub(crate) async fn shutdown<T: Transport>(
    device: &Device,
    session: &mut Session<T>,
    grace: Duration,
) {
    if device.is_connected() {
        session
            .publish(encoder::state(&device.topics(), DeviceState::Disconnected))
            .await;
    }
    if let Err(e) = session.flush().await {
        tracing::debug!(device = %device.id(), error = %e, "Final publications not acknowledged");
    }

    device.set_connected(false);
    device.set_state(DeviceState::Disconnected);

    if let Err(e) = session.transport().disconnect(grace).await {
        tracing::warn!(device = %device.id(), error = %e, "Disconnect failed");
    }
    tracing::info!(device = %device.id(), "Device stopped");
}
