// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core value types shared by the registry, dispatcher and publisher.

mod sensor_id;
mod sensor_record;
mod sensor_type;

pub use sensor_id::SensorId;
pub use sensor_record::{
    PROP_BATTERY, PROP_SIGNAL, PROP_STATE, PROP_TIME_LAST_ALARM, SensorMetadata, SensorRecord,
};
pub use sensor_type::SensorType;
