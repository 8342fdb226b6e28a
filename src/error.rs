// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the Homie runtime.
//!
//! Errors fall into two families. [`ConfigError`] covers programming
//! mistakes made while building the device tree; they are returned at the
//! call site before any network activity happens. [`TransportError`] covers
//! broker communication failures; inside the run loop these are logged and
//! repaired by the next full republication rather than propagated.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The device tree was configured incorrectly.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker communication failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Smart-plug bridge failure.
    #[cfg(feature = "kasa")]
    #[error("kasa error: {0}")]
    Kasa(#[from] KasaError),

    /// The outbound publish queue is full.
    #[error("publish queue for device {0} is full")]
    QueueFull(String),

    /// The device's run loop is gone and can no longer accept work.
    #[error("publish queue for device {0} is closed")]
    QueueClosed(String),
}

/// Errors raised by the registration API.
///
/// All of these indicate a mistake in the hosting application and are never
/// retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An identifier does not follow the convention's grammar.
    #[error("invalid identifier {id:?}: {reason}")]
    InvalidIdentifier {
        /// The rejected identifier.
        id: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A device with this id is already registered.
    #[error("duplicate device id: {0}")]
    DuplicateDevice(String),

    /// The device already has a node with this id.
    #[error("device {device} already has a node {node}")]
    DuplicateNode {
        /// Owning device id.
        device: String,
        /// Colliding node id.
        node: String,
    },

    /// The node already has a property with this id.
    #[error("node {node} already has a property {property}")]
    DuplicateProperty {
        /// Owning node id.
        node: String,
        /// Colliding property id.
        property: String,
    },

    /// The datatype is not one of the convention's datatypes.
    #[error("invalid datatype: {0}")]
    InvalidDatatype(String),

    /// The unit is not in the convention's allow-list.
    #[error("invalid unit: {0}")]
    InvalidUnit(String),

    /// The device tree was modified after the run loop started.
    #[error("device {0} configuration is frozen")]
    ConfigFrozen(String),

    /// `run` was called on a device whose loop already started.
    #[error("device {0} is already running")]
    AlreadyRunning(String),

    /// A handle refers to a node or property that does not exist.
    #[error("unknown {kind}: {id}")]
    Unknown {
        /// Either `"node"` or `"property"`.
        kind: &'static str,
        /// The missing identifier.
        id: String,
    },
}

/// Errors related to broker communication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The MQTT client rejected a request.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Connection to the broker failed or dropped.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No session is established.
    #[error("not connected")]
    NotConnected,

    /// The broker refused a subscription.
    #[error("subscription to {0} rejected")]
    SubscriptionRejected(String),

    /// An acknowledgement did not arrive in time.
    #[error("no acknowledgement after {0} ms")]
    Timeout(u64),

    /// Invalid URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for TransportError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Mqtt(err.to_string())
    }
}

/// Errors from the smart-plug wire protocol.
#[cfg(feature = "kasa")]
#[derive(Debug, Error)]
pub enum KasaError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The status envelope is not valid JSON.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The status envelope lacks a required section.
    #[error("missing field in response: {0}")]
    MissingField(&'static str),

    /// `relay_state` was neither 0 nor 1.
    #[error("invalid relay state: {0}")]
    InvalidRelayState(f64),

    /// A length-prefixed frame was truncated or oversized.
    #[error("bad frame: {0}")]
    Frame(String),

    /// The network is not valid CIDR notation.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::DuplicateNode {
            device: "dev".to_string(),
            node: "outlet".to_string(),
        };
        assert_eq!(err.to_string(), "device dev already has a node outlet");
    }

    #[test]
    fn error_from_config_error() {
        let err: Error = ConfigError::InvalidUnit("furlong".to_string()).into();
        assert!(matches!(err, Error::Config(ConfigError::InvalidUnit(_))));
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(
            TransportError::Timeout(1500).to_string(),
            "no acknowledgement after 1500 ms"
        );
    }
}
