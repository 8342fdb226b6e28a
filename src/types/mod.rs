// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types of the Homie convention.
//!
//! Each type only admits the values the convention allows, so an invalid
//! datatype or unit is rejected when it is parsed rather than when the tree
//! is published.
//!
//! # Types
//!
//! - [`Datatype`] - Property payload types (string, integer, float, ...)
//! - [`Unit`] - The allow-list of property units
//! - [`DeviceState`] - Device lifecycle states published on `$state`
//! - [`Extension`] - Supported convention extensions

mod datatype;
mod device_state;
mod unit;

pub use datatype::Datatype;
pub use device_state::{DeviceState, Extension};
pub use unit::Unit;
