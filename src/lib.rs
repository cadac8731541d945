// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `sensebridge` - bridge a Wyze Sense sensor fleet to Home Assistant.
//!
//! A USB dongle reports alarms (open/close, motion, leak) and presence
//! changes from its paired sensors. This crate keeps a persistent registry
//! of those sensors, applies every event to it, and forwards the result to
//! an MQTT broker as Home Assistant discovery blocks and retained state.
//!
//! # Pipeline
//!
//! ```text
//! driver events ──► Dispatcher ──► Registry (mutate + persist)
//!                        │
//!                        └──► Publisher ──► MQTT broker
//! ```
//!
//! - [`driver`]: the dongle boundary and the helper-process driver
//! - [`registry`]: the lock-guarded sensor map and its persistence
//! - [`dispatch`]: the event loop, the only steady-state writer
//! - [`publisher`]: at-most-once delivery to the broker
//! - [`discovery`]: Home Assistant `binary_sensor` payloads and topics
//! - [`api`]: the HTTP query surface
//!
//! # Quick Start
//!
//! ```no_run
//! use sensebridge::app;
//! use sensebridge::config::JsonFileStore;
//! use sensebridge::registry::Registry;
//!
//! #[tokio::main]
//! async fn main() -> sensebridge::Result<()> {
//!     let registry = Registry::open(JsonFileStore::new(app::config_path()))?;
//!     app::init_logging(registry.log_level());
//!
//!     app::run(registry, app::shutdown_signal()).await
//! }
//! ```
//!
//! # Features
//!
//! - `api` (default): the warp HTTP surface
//! - `mqtt` (default): the `rumqttc` broker transport

#[cfg(feature = "api")]
pub mod api;
pub mod app;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod types;

#[cfg(test)]
mod testing;

pub use app::Bridge;
pub use config::{AppConfig, DocumentStore, JsonFileStore, MemoryStore, MqttSettings};
pub use dispatch::{DispatchState, Dispatcher};
pub use driver::{AlarmEvent, DriverEvents, PresenceEvent, SensorDriver};
pub use error::{ConfigError, DeviceError, Error, ProtocolError, Result};
pub use protocol::{BrokerTransport, ConnectionState};
#[cfg(feature = "mqtt")]
pub use protocol::MqttTransport;
pub use publisher::{Publisher, PublisherHandle, StateSlot, Topics};
pub use registry::{Registry, RegistryGuard};
pub use types::{SensorId, SensorMetadata, SensorRecord, SensorType};
