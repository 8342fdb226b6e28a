// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property datatypes.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// The payload type of a property, published on `$datatype`.
///
/// Values are always carried as strings on the wire; the datatype tells
/// controllers how to interpret them.
///
/// # Examples
///
/// ```
/// use homie_runtime::types::Datatype;
///
/// let dt: Datatype = "integer".parse().unwrap();
/// assert_eq!(dt, Datatype::Integer);
/// assert_eq!(dt.as_str(), "integer");
/// assert!("decimal".parse::<Datatype>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Datatype {
    /// Free-form text.
    #[default]
    String,
    /// Signed integer.
    Integer,
    /// Floating point number.
    Float,
    /// `true` or `false`.
    Boolean,
    /// One of a comma separated list given in `$format`.
    Enum,
    /// `rgb` or `hsv` triple, selected by `$format`.
    Color,
}

impl Datatype {
    /// Returns the name published on `$datatype`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
            Self::Color => "color",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "enum" => Ok(Self::Enum),
            "color" => Ok(Self::Color),
            _ => Err(ConfigError::InvalidDatatype(s.to_string())),
        }
    }
}
