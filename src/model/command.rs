// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command handler types.

use std::sync::Arc;

use super::{NodeSnapshot, PropertySnapshot};

/// Handler for inbound `/set` commands.
///
/// Handlers run on whichever task delivered the message. They see a
/// snapshot of the target and return what should happen; they never write
/// device state themselves.
pub type CommandHandler = Arc<dyn Fn(&Command<'_>) -> CommandOutcome + Send + Sync>;

/// Handler for `<base>/$broadcast/<level>` messages, called as
/// `(level, value)`.
pub type BroadcastHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// An inbound command for a settable property.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    /// Id of the addressed device.
    pub device_id: &'a str,
    /// The addressed node.
    pub node: &'a NodeSnapshot,
    /// The addressed property, including its last-known value.
    pub property: &'a PropertySnapshot,
    /// The requested value as sent by the controller.
    pub payload: &'a str,
}

/// What a command handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Not for this handler; the next handler in the chain runs.
    Unhandled,
    /// Claimed; the chain stops and nothing is published.
    Handled,
    /// Claimed; the chain stops and the property is updated to this value
    /// through the publish queue.
    Update(String),
}

impl CommandOutcome {
    /// Returns whether the handler claimed the command.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        !matches!(self, Self::Unhandled)
    }
}
