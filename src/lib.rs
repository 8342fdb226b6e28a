// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Homie Runtime - device-side runtime for the Homie v4 convention over MQTT.
//!
//! Application code describes a device as a tree of nodes and properties;
//! the runtime announces that tree as retained MQTT topics, keeps it
//! current across reconnects, publishes property updates and routes
//! controller commands to handlers.
//!
//! # Features
//!
//! - **Registration API**: build the device → node → property tree with
//!   identifier, datatype and unit validation
//! - **Lifecycle**: `init` → full republication → `ready` on every
//!   (re)connect, `lost` as last will, `disconnected` on orderly shutdown
//! - **Commands**: `/set` messages run through a global → node → property
//!   handler chain; `$broadcast` messages reach a broadcast handler
//! - **Transports**: MQTT via `rumqttc` (feature `mqtt`) and an in-memory
//!   broker for tests
//! - **Smart-plug bridge**: mirrors local-network plugs as devices
//!   (feature `kasa`)
//!
//! # Quick Start
//!
//! ```no_run
//! use homie_runtime::model::{CommandOutcome, DeviceRegistry};
//! use homie_runtime::protocol::MqttTransport;
//! use homie_runtime::types::Datatype;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> homie_runtime::Result<()> {
//!     let registry = DeviceRegistry::new();
//!     let device = registry.create_device("test-device-0001", "Test Device")?;
//!
//!     let outlet = device.new_node("outlet", "Outlet", "relay")?;
//!     let on = outlet.advertise("on", "On", Datatype::Boolean)?;
//!     on.settable(|cmd| CommandOutcome::Update(cmd.payload.to_string()))?;
//!     on.message().try_send("false")?;
//!
//!     let transport = MqttTransport::from_url("tcp://127.0.0.1:1883")?;
//!     device.run(transport, CancellationToken::new()).await
//! }
//! ```
//!
//! # Property Updates
//!
//! Values are queued, never published directly. The run loop stores each
//! value and publishes it while connected; a value queued while offline is
//! kept and goes out with the next announcement.
//!
//! ```no_run
//! # use homie_runtime::model::Property;
//! # async fn example(temperature: Property) -> homie_runtime::Result<()> {
//! temperature.message().send("21.5").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
#[cfg(feature = "kasa")]
pub mod kasa;
pub mod model;
pub mod protocol;
mod runtime;
pub mod types;
pub mod validate;

pub use error::{ConfigError, Error, Result, TransportError};
#[cfg(feature = "kasa")]
pub use error::KasaError;
pub use model::{
    Command, CommandOutcome, Device, DeviceRegistry, Node, Property, PropertyMessage,
};
#[cfg(feature = "mqtt")]
pub use protocol::MqttTransport;
pub use protocol::{MemoryBroker, QoS, Transport};
pub use runtime::CLIENT_ID_PREFIX;
pub use types::{Datatype, DeviceState, Unit};
