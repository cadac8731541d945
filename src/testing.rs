// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fakes shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::MemoryStore;
use crate::driver::SensorDriver;
use crate::error::{DeviceError, ProtocolError};
use crate::protocol::BrokerTransport;
use crate::types::SensorId;

/// One recorded publish.
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    /// Store saves counted when the publish happened.
    pub saves: Option<usize>,
}

/// Broker transport that records publishes.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub connected: AtomicBool,
    pub disconnects: AtomicUsize,
    published: Mutex<Vec<Published>>,
    observed_store: Option<Arc<MemoryStore>>,
}

impl RecordingTransport {
    pub fn connected() -> Arc<Self> {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// A connected transport noting the save count of `store` on each publish.
    pub fn observing(store: Arc<MemoryStore>) -> Arc<Self> {
        let transport = Self {
            observed_store: Some(store),
            ..Self::default()
        };
        transport.connected.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.topic.clone()).collect()
    }
}

impl BrokerTransport for RecordingTransport {
    async fn connect(&self) {
        while !self.connected.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ProtocolError> {
        let saves = self.observed_store.as_ref().map(|store| store.save_count());
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload,
            retain,
            saves,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sensor driver answering from canned values.
#[derive(Default)]
pub(crate) struct FakeDriver {
    pub sensors: Mutex<Vec<SensorId>>,
    pub scan_result: Mutex<Option<SensorId>>,
    pub deleted: Mutex<Vec<SensorId>>,
    pub offline: AtomicBool,
}

impl FakeDriver {
    pub fn with_sensors(ids: &[&str]) -> Self {
        let driver = Self::default();
        *driver.sensors.lock() = ids.iter().copied().map(SensorId::new).collect();
        driver
    }

    fn check_online(&self) -> Result<(), DeviceError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(DeviceError::Rejected("dongle offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SensorDriver for FakeDriver {
    async fn list_sensors(&self) -> Result<Vec<SensorId>, DeviceError> {
        self.check_online()?;
        Ok(self.sensors.lock().clone())
    }

    async fn scan_sensor(&self) -> Result<SensorId, DeviceError> {
        self.check_online()?;
        self.scan_result
            .lock()
            .clone()
            .ok_or_else(|| DeviceError::Rejected("no sensor found".to_string()))
    }

    async fn delete_sensor(&self, id: &SensorId) -> Result<(), DeviceError> {
        self.check_online()?;
        self.deleted.lock().push(id.clone());
        Ok(())
    }
}
