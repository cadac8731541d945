// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Home Assistant MQTT discovery.
//!
//! Each sensor is announced as a `binary_sensor` whose state and attributes
//! are read from the sensor's event topic. The same block is served by the
//! HTTP surface for users who prefer a static Home Assistant configuration.
//!
//! # Topics
//!
//! - `{discovery_root}/binary_sensor/{id}/config`: retained discovery block
//! - `{sensor_root}/{id}`: retained record JSON, updated on every alarm
//!
//! # Examples
//!
//! ```
//! use sensebridge::discovery::{BinarySensorConfig, discovery_topic};
//! use sensebridge::{SensorId, SensorRecord};
//!
//! let record = SensorRecord::new(SensorId::new("7779768D"));
//! let config = BinarySensorConfig::from_record("gosense", &record);
//!
//! assert_eq!(config.state_topic, "gosense/7779768D");
//! assert_eq!(
//!     discovery_topic("gosense_discovery", record.id()),
//!     "gosense_discovery/binary_sensor/7779768D/config"
//! );
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{SensorId, SensorRecord};

/// Platform tag Home Assistant expects for MQTT entities.
pub const PLATFORM_MQTT: &str = "mqtt";
/// Payload meaning "on" (open, motion, leak).
pub const PAYLOAD_ON: &str = "1";
/// Payload meaning "off".
pub const PAYLOAD_OFF: &str = "0";
/// Template extracting the state from the record JSON.
pub const VALUE_TEMPLATE: &str = "{{ value_json.properties.state }}";
/// Template exposing all properties as entity attributes.
pub const ATTRIBUTES_TEMPLATE: &str = "{{ value_json.properties | tojson }}";

/// Returns the retained discovery topic of a sensor.
#[must_use]
pub fn discovery_topic(discovery_root: &str, id: &SensorId) -> String {
    format!("{discovery_root}/binary_sensor/{id}/config")
}

/// Returns the event topic of a sensor.
#[must_use]
pub fn state_topic(sensor_root: &str, id: &SensorId) -> String {
    format!("{sensor_root}/{id}")
}

/// A Home Assistant `binary_sensor` discovery block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinarySensorConfig {
    /// Always [`PLATFORM_MQTT`].
    pub platform: String,
    /// Display name.
    pub name: String,
    /// Stable entity id (the sensor identifier).
    pub unique_id: String,
    /// Payload for "on".
    pub payload_on: String,
    /// Payload for "off".
    pub payload_off: String,
    /// Topic the state is read from.
    pub state_topic: String,
    /// Template extracting the state.
    pub value_template: String,
    /// Topic the attributes are read from.
    pub json_attributes_topic: String,
    /// Template extracting the attributes.
    pub json_attributes_template: String,
}

impl BinarySensorConfig {
    /// Builds the discovery block for a record.
    #[must_use]
    pub fn from_record(sensor_root: &str, record: &SensorRecord) -> Self {
        let topic = state_topic(sensor_root, record.id());

        Self {
            platform: PLATFORM_MQTT.to_string(),
            name: record.name().to_string(),
            unique_id: record.id().to_string(),
            payload_on: PAYLOAD_ON.to_string(),
            payload_off: PAYLOAD_OFF.to_string(),
            state_topic: topic.clone(),
            value_template: VALUE_TEMPLATE.to_string(),
            json_attributes_topic: topic,
            json_attributes_template: ATTRIBUTES_TEMPLATE.to_string(),
        }
    }
}

/// Static Home Assistant configuration listing every known sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    /// One block per sensor.
    #[serde(rename = "binary_sensor")]
    pub binary_sensors: Vec<BinarySensorConfig>,
}

impl HomeAssistantConfig {
    /// Builds the configuration for a set of records.
    #[must_use]
    pub fn from_records<'a>(
        sensor_root: &str,
        records: impl IntoIterator<Item = &'a SensorRecord>,
    ) -> Self {
        Self {
            binary_sensors: records
                .into_iter()
                .map(|record| BinarySensorConfig::from_record(sensor_root, record))
                .collect(),
        }
    }
}
