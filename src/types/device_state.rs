// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle states and convention extensions.

use std::fmt;
use std::str::FromStr;

/// The lifecycle state published on `<base>/<device>/$state`.
///
/// The runtime itself only ever moves through `Init`, `Ready` and
/// `Disconnected`. `Lost` is what the broker publishes on the device's
/// behalf through the last-will message when the connection drops without
/// an orderly disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    /// Constructed or (re)connecting; the tree is not yet fully announced.
    #[default]
    Init,
    /// Tree published, accepting commands.
    Ready,
    /// Intentionally shut down.
    Disconnected,
    /// Abnormal termination, as seen by remote observers.
    Lost,
}

impl DeviceState {
    /// Returns the payload published on `$state`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "ready" => Ok(Self::Ready),
            "disconnected" => Ok(Self::Disconnected),
            "lost" => Ok(Self::Lost),
            other => Err(format!("unknown device state: {other}")),
        }
    }
}

/// A convention extension announced on `$extensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// `$stats/interval` and `$stats/uptime`.
    LegacyStats,
    /// `$fw/name` and `$fw/version`.
    LegacyFirmware,
}

impl Extension {
    /// The extensions this runtime implements, in announcement order.
    pub const SUPPORTED: [Extension; 2] = [Self::LegacyStats, Self::LegacyFirmware];

    /// Returns the extension identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyStats => "org.homie.legacy-stats:0.1.1:[4.x]",
            Self::LegacyFirmware => "org.homie.legacy-firmware:0.1.1:[4.x]",
        }
    }

    /// Returns the `$extensions` payload for all supported extensions.
    #[must_use]
    pub fn announcement() -> String {
        Self::SUPPORTED
            .iter()
            .map(Extension::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
