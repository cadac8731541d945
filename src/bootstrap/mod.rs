// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Startup reconciliation between the dongle and the registry.

use crate::driver::SensorDriver;
use crate::error::DeviceError;
use crate::publisher::PublisherHandle;
use crate::registry::Registry;
use crate::types::{SensorId, SensorRecord};

/// Merges the sensors known to the dongle into the registry.
///
/// Unknown identifiers get a fresh present record; existing records are left
/// untouched and nothing is ever removed. The document is persisted once.
/// With a publisher, every sensor is then announced from a background task,
/// so an unreachable broker does not hold up startup.
///
/// Returns the number of records added.
///
/// # Errors
///
/// Returns `DeviceError` if the dongle cannot list its sensors.
pub async fn reconcile<D: SensorDriver>(
    registry: &Registry,
    driver: &D,
    publisher: Option<&PublisherHandle>,
) -> Result<usize, DeviceError> {
    let known = driver.list_sensors().await?;
    tracing::info!(count = known.len(), "Dongle reported paired sensors");

    let (added, ids) = {
        let mut guard = registry.lock();
        let mut added = 0;
        for id in &known {
            if !guard.contains(id) {
                guard.upsert(id, |_| {});
                tracing::info!(sensor = %id, "Registered sensor found on dongle");
                added += 1;
            }
        }
        guard.persist();
        let ids: Vec<SensorId> = guard.records().map(|record| record.id().clone()).collect();
        (added, ids)
    };

    if let Some(publisher) = publisher {
        tokio::spawn(announce(registry.clone(), publisher.clone(), ids));
    }

    Ok(added)
}

/// Queues the discovery state of each sensor as the registry holds it when
/// its queue slot frees up.
///
/// Reading after reserving keeps a later presence change from being
/// overtaken by an older view of the sensor. A sensor removed in the
/// meantime is announced as absent, which clears its discovery block.
async fn announce(registry: Registry, publisher: PublisherHandle, ids: Vec<SensorId>) {
    let count = ids.len();
    for id in ids {
        let Some(slot) = publisher.reserve_state().await else {
            tracing::debug!("Publisher closed, abandoning startup announcements");
            return;
        };

        let record = registry.get(&id).unwrap_or_else(|| {
            let mut gone = SensorRecord::new(id);
            gone.metadata.present = false;
            gone
        });
        slot.submit(record);
    }
    tracing::debug!(count, "Queued startup announcements");
}
