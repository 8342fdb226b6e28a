// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifier validation.
//!
//! Homie identifiers may only contain lowercase ASCII letters, digits and
//! hyphens, and may not start with a hyphen. Attribute names additionally
//! start with `$`.

use crate::error::ConfigError;

/// Validates and normalizes an identifier.
///
/// Uppercase ASCII letters are folded to lowercase. When `allow_attribute`
/// is true, a leading `$` is accepted.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidIdentifier`] if the input is empty, starts
/// with `-`, or contains a character outside the grammar.
///
/// # Examples
///
/// ```
/// use homie_runtime::validate::validate;
///
/// assert_eq!(validate("Living-Room", false).unwrap(), "living-room");
/// assert_eq!(validate("$state", true).unwrap(), "$state");
/// assert!(validate("-leading", false).is_err());
/// ```
pub fn validate(input: &str, allow_attribute: bool) -> Result<String, ConfigError> {
    let invalid = |reason| ConfigError::InvalidIdentifier {
        id: input.to_string(),
        reason,
    };

    let bytes = input.as_bytes();
    match bytes.first() {
        None => return Err(invalid("identifier is empty")),
        Some(b'-') => return Err(invalid("identifier may not begin with '-'")),
        Some(_) => {}
    }

    let mut normalized = String::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => normalized.push(char::from(b)),
            b'A'..=b'Z' => normalized.push(char::from(b.to_ascii_lowercase())),
            b'$' if i == 0 && allow_attribute => normalized.push('$'),
            _ => return Err(invalid("invalid character in identifier")),
        }
    }

    Ok(normalized)
}
