// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property units.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// A unit from the convention's allow-list, published on `$unit`.
///
/// # Examples
///
/// ```
/// use homie_runtime::types::Unit;
///
/// assert_eq!("°C".parse::<Unit>().unwrap(), Unit::Celsius);
/// assert_eq!(Unit::Watt.as_str(), "W");
/// assert!("furlong".parse::<Unit>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Degrees Celsius.
    Celsius,
    /// Degrees Fahrenheit.
    Fahrenheit,
    /// Angle in degrees.
    Degree,
    /// Liters.
    Liter,
    /// Gallons.
    Gallon,
    /// Volts.
    Volt,
    /// Watts.
    Watt,
    /// Amperes.
    Ampere,
    /// Percentage.
    Percent,
    /// Meters.
    Meter,
    /// Feet.
    Feet,
    /// Pascal.
    Pascal,
    /// Pounds per square inch.
    Psi,
    /// Count or amount.
    Count,
}

impl Unit {
    /// Every allowed unit.
    pub const ALL: [Unit; 14] = [
        Self::Celsius,
        Self::Fahrenheit,
        Self::Degree,
        Self::Liter,
        Self::Gallon,
        Self::Volt,
        Self::Watt,
        Self::Ampere,
        Self::Percent,
        Self::Meter,
        Self::Feet,
        Self::Pascal,
        Self::Psi,
        Self::Count,
    ];

    /// Returns the symbol published on `$unit`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Celsius => "°C",
            Self::Fahrenheit => "°F",
            Self::Degree => "°",
            Self::Liter => "L",
            Self::Gallon => "gal",
            Self::Volt => "V",
            Self::Watt => "W",
            Self::Ampere => "A",
            Self::Percent => "%",
            Self::Meter => "m",
            Self::Feet => "ft",
            Self::Pascal => "pascal",
            Self::Psi => "psi",
            Self::Count => "#",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidUnit(s.to_string()))
    }
}
