// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge exposing local-network smart plugs as Homie devices.
//!
//! Plugs answer an obfuscated JSON status query on UDP and TCP port 9999.
//! [`KasaBridge`] broadcasts that query periodically and mirrors every
//! answering plug as a [`Device`](crate::model::Device) with one node,
//! `outlet`, holding a settable boolean property `on`.
//!
//! # Examples
//!
//! ```no_run
//! use homie_runtime::kasa::{KasaBridge, KasaConfig};
//! use homie_runtime::model::DeviceRegistry;
//! use homie_runtime::protocol::MqttTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = KasaBridge::bind(
//!     KasaConfig::default().with_network("192.168.0.0/24"),
//!     DeviceRegistry::new(),
//!     |_: &str| MqttTransport::builder().host("192.168.0.10").build().expect("valid host"),
//! )
//! .await?;
//!
//! bridge.run(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```

mod bridge;
pub mod cipher;
mod sysinfo;

pub use bridge::{DEFAULT_BRIDGE_TOPIC_BASE, KasaBridge, KasaConfig, ON_PROPERTY, OUTLET_NODE};
pub use sysinfo::{
    DEFAULT_NETWORK, KASA_PORT, PlugStatus, RELAY_OFF, RELAY_ON, STATUS_QUERY, broadcast_address,
    homie_id, parse_status, parse_switch, relay_command,
};
