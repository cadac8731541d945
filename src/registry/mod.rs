// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sensor registry.
//!
//! The [`Registry`] owns the configuration document, including the map of
//! sensor records, behind one coarse lock. Every mutation is expected to be
//! followed by [`RegistryGuard::persist`] while the same guard is held, so
//! the file on disk always reflects the last processed event.
//!
//! # Examples
//!
//! ```
//! use sensebridge::config::{AppConfig, MemoryStore};
//! use sensebridge::registry::Registry;
//! use sensebridge::SensorId;
//!
//! let registry = Registry::new(AppConfig::default(), MemoryStore::default());
//!
//! {
//!     let mut guard = registry.lock();
//!     guard.upsert(&SensorId::new("AA:BB"), |record| {
//!         record.metadata.present = true;
//!     });
//!     guard.persist();
//! }
//!
//! assert!(registry.get(&SensorId::new("AA:BB")).is_some());
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::{AppConfig, DocumentStore, DriverSettings, LogLevel, MqttSettings};
use crate::error::ConfigError;
use crate::types::{SensorId, SensorRecord};

/// Shared handle to the sensor registry.
///
/// Cheap to clone; all clones see the same document and lock.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    document: Mutex<AppConfig>,
    store: Box<dyn DocumentStore>,
}

impl Registry {
    /// Creates a registry around an already loaded document.
    #[must_use]
    pub fn new(document: AppConfig, store: impl DocumentStore + 'static) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                document: Mutex::new(document),
                store: Box::new(store),
            }),
        }
    }

    /// Loads the document from `store`, fills defaults and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document cannot be loaded.
    pub fn open(store: impl DocumentStore + 'static) -> Result<Self, ConfigError> {
        let mut document = store.load()?;
        document.fill_defaults();
        Ok(Self::new(document, store))
    }

    /// Acquires the registry lock.
    ///
    /// The lock is not reentrant and must not be held across an `.await`.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            document: self.inner.document.lock(),
            store: self.inner.store.as_ref(),
        }
    }

    /// Looks up one record.
    #[must_use]
    pub fn get(&self, id: &SensorId) -> Option<SensorRecord> {
        self.lock().get(id).cloned()
    }

    /// Returns a snapshot of all records.
    #[must_use]
    pub fn list(&self) -> Vec<SensorRecord> {
        self.lock().list()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the broker settings.
    #[must_use]
    pub fn settings(&self) -> MqttSettings {
        self.lock().document.mqtt.clone()
    }

    /// Returns the driver settings.
    #[must_use]
    pub fn driver_settings(&self) -> DriverSettings {
        self.lock().document.driver.clone()
    }

    /// Returns the configured log level.
    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.lock().document.debug_level
    }

    /// Returns the port of the HTTP query surface.
    #[must_use]
    pub fn api_port(&self) -> u16 {
        self.lock().document.api_port
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sensors", &self.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the registry; released on drop.
pub struct RegistryGuard<'a> {
    document: MutexGuard<'a, AppConfig>,
    store: &'a dyn DocumentStore,
}

impl RegistryGuard<'_> {
    /// Looks up one record.
    #[must_use]
    pub fn get(&self, id: &SensorId) -> Option<&SensorRecord> {
        self.document.sensors.get(id)
    }

    /// Looks up one record for in-place modification.
    pub fn get_mut(&mut self, id: &SensorId) -> Option<&mut SensorRecord> {
        self.document.sensors.get_mut(id)
    }

    /// Returns true if a record exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &SensorId) -> bool {
        self.document.sensors.contains_key(id)
    }

    /// Returns a snapshot of all records.
    #[must_use]
    pub fn list(&self) -> Vec<SensorRecord> {
        self.document.sensors.values().cloned().collect()
    }

    /// Iterates over the records in identifier order.
    pub fn records(&self) -> impl Iterator<Item = &SensorRecord> {
        self.document.sensors.values()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.document.sensors.len()
    }

    /// Returns true if the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.sensors.is_empty()
    }

    /// Returns the root of the per-sensor event topics.
    #[must_use]
    pub fn sensor_topic(&self) -> &str {
        &self.document.mqtt.sensor_topic
    }

    /// Creates or updates a record and returns it.
    ///
    /// A missing record is created present, with empty properties and named
    /// after its identifier, before `mutate` runs. Fields `mutate` leaves
    /// alone (sensor type included) keep their previous value.
    pub fn upsert<F>(&mut self, id: &SensorId, mutate: F) -> &SensorRecord
    where
        F: FnOnce(&mut SensorRecord),
    {
        let record = self
            .document
            .sensors
            .entry(id.clone())
            .or_insert_with(|| SensorRecord::new(id.clone()));
        mutate(record);
        record
    }

    /// Removes a record, returning it if it existed.
    pub fn remove(&mut self, id: &SensorId) -> Option<SensorRecord> {
        self.document.sensors.remove(id)
    }

    /// Saves the whole document.
    ///
    /// Failures are logged and reported as `false`; the in-memory state is
    /// kept either way.
    pub fn persist(&self) -> bool {
        match self.store.save(&self.document) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist sensor registry");
                false
            }
        }
    }
}
