// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating the sense dongle among the hidraw devices.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DeviceError;

const HIDRAW_CLASS_DIR: &str = "/sys/class/hidraw";
/// USB vendor/product of the sense dongle as it appears in `HID_ID`.
const SENSE_HID_ID: &str = "00001A86:0000E024";

/// Returns the `/dev/hidrawN` node of the first sense dongle plugged in.
///
/// # Errors
///
/// Returns `DeviceError::NotFound` if no dongle is present.
pub fn find_sense_device() -> Result<PathBuf, DeviceError> {
    find_sense_device_in(Path::new(HIDRAW_CLASS_DIR))
}

/// Same as [`find_sense_device`], scanning a custom sysfs class directory.
///
/// # Errors
///
/// Returns `DeviceError::NotFound` if no dongle is present.
pub fn find_sense_device_in(class_dir: &Path) -> Result<PathBuf, DeviceError> {
    tracing::info!(dir = %class_dir.display(), "Looking for sense dongle");

    let mut names: Vec<_> = fs::read_dir(class_dir)
        .map_err(|_| DeviceError::NotFound)?
        .filter_map(|entry| entry.ok().map(|e| e.file_name()))
        .collect();
    names.sort();

    for name in names {
        let uevent = class_dir.join(&name).join("device/uevent");
        let Ok(contents) = fs::read_to_string(&uevent) else {
            continue;
        };

        let matches = contents
            .lines()
            .any(|line| line.starts_with("HID_ID=") && line.contains(SENSE_HID_ID));
        if matches {
            let device = Path::new("/dev").join(&name);
            tracing::info!(device = %device.display(), "Found sense dongle");
            return Ok(device);
        }
    }

    Err(DeviceError::NotFound)
}
