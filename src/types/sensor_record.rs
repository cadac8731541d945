// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sensor record kept in the registry.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{SensorId, SensorType};

/// Property key holding the last reported state code.
pub const PROP_STATE: &str = "state";
/// Property key holding the last reported battery level.
pub const PROP_BATTERY: &str = "battery";
/// Property key holding the last reported signal strength.
pub const PROP_SIGNAL: &str = "signal";
/// Property key holding the RFC 3339 time of the last alarm.
pub const PROP_TIME_LAST_ALARM: &str = "timeLastAlarm";

/// Identity and presence of a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorMetadata {
    /// Display name (defaults to the identifier).
    pub name: String,
    /// Stable identifier.
    pub mac: SensorId,
    /// Category reported by the dongle.
    #[serde(default)]
    pub sensor_type: SensorType,
    /// Whether the dongle currently knows about the sensor.
    #[serde(default)]
    pub present: bool,
}

/// One sensor as kept in the registry and sent to the broker.
///
/// The JSON shape (`metadata` + `properties`) is what the Home Assistant
/// templates point at, so it is shared by persistence and event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Identity and presence.
    pub metadata: SensorMetadata,
    /// Latest reported readings, keyed by property name.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl SensorRecord {
    /// Creates a present record with empty properties, named after its id.
    #[must_use]
    pub fn new(id: SensorId) -> Self {
        Self {
            metadata: SensorMetadata {
                name: id.to_string(),
                mac: id,
                sensor_type: SensorType::Unknown,
                present: true,
            },
            properties: HashMap::new(),
        }
    }

    /// Returns the record identifier.
    #[must_use]
    pub fn id(&self) -> &SensorId {
        &self.metadata.mac
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns whether the sensor is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.metadata.present
    }

    /// Returns a property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Records the readings carried by an alarm.
    pub fn apply_alarm_readings(
        &mut self,
        state: u8,
        battery: u8,
        signal: i16,
        timestamp: DateTime<Utc>,
    ) {
        self.properties
            .insert(PROP_STATE.to_string(), state.to_string());
        self.properties
            .insert(PROP_BATTERY.to_string(), battery.to_string());
        self.properties
            .insert(PROP_SIGNAL.to_string(), signal.to_string());
        self.properties.insert(
            PROP_TIME_LAST_ALARM.to_string(),
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
}
