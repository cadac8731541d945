// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sensor category reported by the dongle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a sensor, as reported by the dongle.
///
/// The dongle encodes the category as a single byte. Known codes get their
/// own variant; anything else is kept as [`SensorType::Other`] so that it
/// survives a save/load cycle unchanged.
///
/// # Examples
///
/// ```
/// use sensebridge::SensorType;
///
/// assert_eq!(SensorType::from(2), SensorType::Motion);
/// assert_eq!(u8::from(SensorType::Other(9)), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SensorType {
    /// Category not reported yet.
    #[default]
    Unknown,
    /// Door/window contact switch.
    Switch,
    /// PIR motion sensor.
    Motion,
    /// Water leak sensor.
    Leak,
    /// Any other category code.
    Other(u8),
}

impl From<u8> for SensorType {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Switch,
            2 => Self::Motion,
            3 => Self::Leak,
            other => Self::Other(other),
        }
    }
}

impl From<SensorType> for u8 {
    fn from(kind: SensorType) -> Self {
        match kind {
            SensorType::Unknown => 0,
            SensorType::Switch => 1,
            SensorType::Motion => 2,
            SensorType::Leak => 3,
            SensorType::Other(code) => code,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Switch => f.write_str("switch"),
            Self::Motion => f.write_str("motion"),
            Self::Leak => f.write_str("leak"),
            Self::Other(code) => write!(f, "type {code}"),
        }
    }
}
