// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted configuration document.
//!
//! One JSON document holds both the settings the process starts with and the
//! sensor registry itself, so every registry save rewrites the whole file.
//!
//! # Examples
//!
//! ```
//! use sensebridge::config::AppConfig;
//!
//! let mut config: AppConfig = serde_json::from_str(r#"{"mqtt":{"hostname":"broker"}}"#).unwrap();
//! config.fill_defaults();
//!
//! assert_eq!(config.mqtt.port, 1883);
//! assert_eq!(config.mqtt.sensor_topic, "gosense");
//! assert!(config.sensors.is_empty());
//! ```

mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{SensorId, SensorRecord};

pub use store::{DocumentStore, JsonFileStore, MemoryStore};

/// Default broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Default root for per-sensor event topics.
pub const DEFAULT_SENSOR_TOPIC: &str = "gosense";
/// Default root for discovery topics.
pub const DEFAULT_DISCOVERY_TOPIC: &str = "gosense_discovery";
/// Default port of the HTTP query surface.
pub const DEFAULT_API_PORT: u16 = 8080;
/// Default driver helper command.
pub const DEFAULT_DRIVER_COMMAND: &str = "sensebridge-driver";
/// Environment variable naming the document path.
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
/// Document path used when [`CONFIG_FILE_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "app.json";

/// Verbosity of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Normal operation.
    #[default]
    Info,
    /// Verbose.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Returns the directive understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Broker connection settings.
///
/// Immutable once the process has started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Client identity presented to the broker.
    #[serde(rename = "clientid")]
    pub client_id: String,
    /// Broker host; empty disables publishing.
    pub hostname: String,
    /// Optional user name.
    pub user: String,
    /// Password for `user`.
    pub password: String,
    /// Broker port.
    pub port: u16,
    /// Root of the per-sensor event topics.
    #[serde(rename = "sensorTopic")]
    pub sensor_topic: String,
    /// Root of the discovery topics.
    #[serde(rename = "discoveryTopic")]
    pub discovery_topic: String,
}

impl MqttSettings {
    /// Returns whether a broker is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.hostname.is_empty()
    }

    /// Returns the credentials, if a user is configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.user.is_empty() {
            None
        } else {
            Some((self.user.as_str(), self.password.as_str()))
        }
    }

    /// Returns the broker address in `tcp://host:port` form, for logging.
    #[must_use]
    pub fn server_uri(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port)
    }

    fn fill_defaults(&mut self) {
        if self.client_id.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            self.client_id = format!("ha-sensebridge-{}", &suffix[..8]);
        }
        if self.port == 0 {
            self.port = DEFAULT_MQTT_PORT;
        }
        if self.sensor_topic.is_empty() {
            self.sensor_topic = DEFAULT_SENSOR_TOPIC.to_string();
        }
        if self.discovery_topic.is_empty() {
            self.discovery_topic = DEFAULT_DISCOVERY_TOPIC.to_string();
        }
    }
}

/// How to reach the sensor driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Helper program that owns the dongle.
    pub command: String,
    /// Dongle device node; located through sysfs when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_DRIVER_COMMAND.to_string(),
            device: None,
        }
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Process log verbosity.
    #[serde(rename = "debuglevel", default)]
    pub debug_level: LogLevel,
    /// Port of the HTTP query surface.
    #[serde(rename = "apiPort", default = "default_api_port")]
    pub api_port: u16,
    /// Driver settings.
    #[serde(default)]
    pub driver: DriverSettings,
    /// Broker settings.
    #[serde(default)]
    pub mqtt: MqttSettings,
    /// The sensor registry.
    #[serde(default)]
    pub sensors: BTreeMap<SensorId, SensorRecord>,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug_level: LogLevel::default(),
            api_port: DEFAULT_API_PORT,
            driver: DriverSettings::default(),
            mqtt: MqttSettings::default(),
            sensors: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Fills in the defaults for values left empty in the document.
    pub fn fill_defaults(&mut self) {
        self.mqtt.fill_defaults();
        if self.api_port == 0 {
            self.api_port = DEFAULT_API_PORT;
        }
    }
}
