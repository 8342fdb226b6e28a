// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plug queries, status parsing and identity mapping.

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::KasaError;

/// Port plugs listen on, for both UDP and TCP.
pub const KASA_PORT: u16 = 9999;

/// Network scanned when none is configured.
pub const DEFAULT_NETWORK: &str = "192.168.1.0/24";

/// Asks a plug for its system information and current power reading.
pub const STATUS_QUERY: &str = r#"{"system":{"get_sysinfo":null},"emeter":{"get_realtime":null}}"#;

/// Turns the relay on.
pub const RELAY_ON: &str = r#"{"system":{"set_relay_state":{"state":1}}}"#;

/// Turns the relay off.
pub const RELAY_OFF: &str = r#"{"system":{"set_relay_state":{"state":0}}}"#;

/// Returns the relay command for the requested state.
#[must_use]
pub fn relay_command(on: bool) -> &'static str {
    if on { RELAY_ON } else { RELAY_OFF }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    system: Option<System>,
}

#[derive(Debug, Deserialize)]
struct System {
    get_sysinfo: Option<RawSysinfo>,
}

#[derive(Debug, Deserialize)]
struct RawSysinfo {
    alias: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    relay_state: Option<f64>,
}

/// Status reported by a plug in answer to [`STATUS_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugStatus {
    /// Hardware id, stable across renames.
    pub uid: String,
    /// Homie device id derived from the alias.
    pub id: String,
    /// The alias as set in the vendor app.
    pub name: String,
    /// Whether the relay is closed.
    pub on: bool,
}

/// Parses a decrypted status response.
///
/// # Errors
///
/// - [`KasaError::Json`] if the payload is not JSON
/// - [`KasaError::MissingField`] if the sysinfo section or one of its
///   fields is absent
/// - [`KasaError::InvalidRelayState`] if `relay_state` is neither 0 nor 1
pub fn parse_status(plain: &[u8]) -> Result<PlugStatus, KasaError> {
    let envelope: Envelope = serde_json::from_slice(plain)?;
    let sysinfo = envelope
        .system
        .ok_or(KasaError::MissingField("system"))?
        .get_sysinfo
        .ok_or(KasaError::MissingField("get_sysinfo"))?;

    let alias = sysinfo.alias.ok_or(KasaError::MissingField("alias"))?;
    let uid = sysinfo
        .device_id
        .ok_or(KasaError::MissingField("deviceId"))?;
    let relay_state = sysinfo
        .relay_state
        .ok_or(KasaError::MissingField("relay_state"))?;

    #[allow(clippy::float_cmp)]
    let on = if relay_state == 1.0 {
        true
    } else if relay_state == 0.0 {
        false
    } else {
        return Err(KasaError::InvalidRelayState(relay_state));
    };

    Ok(PlugStatus {
        uid,
        id: homie_id(&alias),
        name: alias,
        on,
    })
}

/// Maps a free-form alias to a Homie device id.
///
/// ASCII alphanumerics are kept and lowercased. Dashes, spaces and
/// underscores become `-` except in first position; everything else is
/// dropped.
#[must_use]
pub fn homie_id(alias: &str) -> String {
    alias
        .chars()
        .enumerate()
        .filter_map(|(i, c)| match c {
            c if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
            '-' | ' ' | '_' if i > 0 => Some('-'),
            _ => None,
        })
        .collect()
}

/// Parses a switch payload.
///
/// Returns `None` for anything that is not a recognised spelling.
#[must_use]
pub fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "ON" | "1" | "true" => Some(true),
        "off" | "OFF" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Returns the broadcast address of an IPv4 network in CIDR notation.
///
/// # Errors
///
/// [`KasaError::InvalidNetwork`] if `cidr` is not `a.b.c.d/len` with a
/// prefix length of at most 32.
pub fn broadcast_address(cidr: &str) -> Result<Ipv4Addr, KasaError> {
    let invalid = || KasaError::InvalidNetwork(cidr.to_string());

    let (addr, prefix) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let host_mask = u32::MAX.checked_shr(prefix).unwrap_or(0);
    Ok(Ipv4Addr::from(u32::from(addr) | host_mask))
}
