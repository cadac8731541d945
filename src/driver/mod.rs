// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sensor driver boundary.
//!
//! A driver produces two event streams (alarms and presence changes) and
//! accepts three requests: list the known sensors, scan for a new one, and
//! delete one. The dongle protocol itself lives behind [`SensorDriver`];
//! [`HelperDriver`] reaches it through a helper process.

mod helper;
mod hidraw;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DeviceError;
use crate::types::{SensorId, SensorType};

pub use helper::HelperDriver;
pub use hidraw::{find_sense_device, find_sense_device_in};

/// Alarm flag meaning "open/close/motion alarm". Other flags carry no state.
pub const ALARM_FLAG_TRIGGER: u8 = 0xA2;

/// Capacity of each device event channel.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// A reading reported by a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    /// Sensor that reported.
    pub mac: SensorId,
    /// Category of the sensor.
    #[serde(default)]
    pub sensor_type: SensorType,
    /// State code (1 = open/motion, 0 = closed/clear).
    pub state: u8,
    /// Battery level.
    pub battery: u8,
    /// Signal strength.
    pub signal: i16,
    /// When the dongle received the alarm.
    pub timestamp: DateTime<Utc>,
    /// Semantics of the event; see [`ALARM_FLAG_TRIGGER`].
    pub flags: u8,
}

impl AlarmEvent {
    /// Returns true if this alarm carries an open/close/motion state.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.flags == ALARM_FLAG_TRIGGER
    }
}

/// A sensor appeared in or disappeared from the dongle's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// Sensor concerned.
    pub mac: SensorId,
    /// Category of the sensor.
    #[serde(default)]
    pub sensor_type: SensorType,
    /// Whether the sensor is now known to the dongle.
    pub present: bool,
}

/// Receiving half of the driver event channels, consumed by the dispatcher.
#[derive(Debug)]
pub struct DriverEvents {
    /// Alarm stream.
    pub alarms: mpsc::Receiver<AlarmEvent>,
    /// Presence stream.
    pub presence: mpsc::Receiver<PresenceEvent>,
}

/// Sending half of the driver event channels, owned by the driver.
#[derive(Debug, Clone)]
pub struct EventSenders {
    /// Alarm stream.
    pub alarms: mpsc::Sender<AlarmEvent>,
    /// Presence stream.
    pub presence: mpsc::Sender<PresenceEvent>,
}

/// Creates the two bounded device event channels.
#[must_use]
pub fn event_channels() -> (EventSenders, DriverEvents) {
    let (alarm_tx, alarm_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (presence_tx, presence_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (
        EventSenders {
            alarms: alarm_tx,
            presence: presence_tx,
        },
        DriverEvents {
            alarms: alarm_rx,
            presence: presence_rx,
        },
    )
}

/// Requests the bridge makes to the sensor driver.
pub trait SensorDriver: Send + Sync + 'static {
    /// Returns the identifiers of all sensors paired with the dongle.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the dongle cannot be queried.
    fn list_sensors(&self) -> impl Future<Output = Result<Vec<SensorId>, DeviceError>> + Send;

    /// Waits for a new sensor to pair and returns its identifier.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if no sensor paired or the dongle failed.
    fn scan_sensor(&self) -> impl Future<Output = Result<SensorId, DeviceError>> + Send;

    /// Unpairs a sensor.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the dongle rejected the request.
    fn delete_sensor(&self, id: &SensorId)
    -> impl Future<Output = Result<(), DeviceError>> + Send;
}
