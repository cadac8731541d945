// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process wiring.
//!
//! [`Bridge`] ties a driver, the registry and an optional publisher
//! together: it reconciles the registry with the dongle, runs the dispatch
//! loop until shutdown, then closes the publisher. [`run`] builds the real
//! components (helper driver, HTTP API, MQTT transport) around it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::bootstrap;
use crate::config::{CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE, LogLevel};
use crate::dispatch::Dispatcher;
use crate::driver::{DriverEvents, SensorDriver};
use crate::error::DeviceError;
use crate::publisher::PublisherHandle;
use crate::registry::Registry;

/// Returns the document path from `CONFIG_FILE`, or `app.json`.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_FILE_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Installs the global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice is a no-op.
pub fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// The running bridge between a driver and the broker.
#[derive(Debug)]
pub struct Bridge<D> {
    registry: Registry,
    driver: Arc<D>,
    publisher: Option<PublisherHandle>,
}

impl<D: SensorDriver> Bridge<D> {
    /// Creates a bridge without a publisher.
    #[must_use]
    pub fn new(registry: Registry, driver: Arc<D>) -> Self {
        Self {
            registry,
            driver,
            publisher: None,
        }
    }

    /// Forwards registry changes to `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: PublisherHandle) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Reconciles, dispatches `events` until `shutdown`, then closes the
    /// publisher.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the dongle cannot list its sensors.
    pub async fn run<S>(self, events: DriverEvents, shutdown: S) -> Result<(), DeviceError>
    where
        S: Future<Output = ()>,
    {
        let reconciled =
            bootstrap::reconcile(&self.registry, self.driver.as_ref(), self.publisher.as_ref())
                .await;
        match reconciled {
            Ok(added) => tracing::info!(added, total = self.registry.len(), "Registry reconciled"),
            Err(e) => {
                self.close_publisher().await;
                return Err(e);
            }
        }

        let mut dispatcher = Dispatcher::new(self.registry.clone(), self.publisher.clone());
        dispatcher.run(events, shutdown).await;
        dispatcher.finish().await;
        Ok(())
    }

    async fn close_publisher(&self) {
        if let Some(publisher) = &self.publisher {
            publisher.close().await;
        }
    }
}

/// Runs the bridge with the helper driver, HTTP API and MQTT publisher until
/// `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the dongle cannot be found, the helper cannot be
/// started, the API port cannot be bound, or reconciliation fails.
#[cfg(all(feature = "api", feature = "mqtt"))]
pub async fn run<S>(registry: Registry, shutdown: S) -> crate::Result<()>
where
    S: Future<Output = ()>,
{
    use std::net::SocketAddr;

    use crate::api::ApiServer;
    use crate::driver::{HelperDriver, event_channels, find_sense_device};
    use crate::protocol::MqttTransport;
    use crate::publisher::{Publisher, Topics};

    let driver_settings = registry.driver_settings();
    let device = match driver_settings.device.clone() {
        Some(device) => device,
        None => find_sense_device()?,
    };

    let (senders, events) = event_channels();
    let driver = Arc::new(HelperDriver::spawn(&driver_settings, &device, senders)?);

    let api_addr = SocketAddr::from(([0, 0, 0, 0], registry.api_port()));
    let api = match ApiServer::start(api_addr, registry.clone(), Arc::clone(&driver)) {
        Ok(api) => api,
        Err(e) => {
            driver.shutdown().await;
            return Err(e);
        }
    };

    let settings = registry.settings();
    let mut bridge = Bridge::new(registry, Arc::clone(&driver));
    if settings.is_enabled() {
        let transport = Arc::new(MqttTransport::new(&settings));
        bridge = bridge.with_publisher(Publisher::spawn(transport, Topics::from_settings(&settings)));
    } else {
        tracing::info!("No MQTT hostname configured, skipping MQTT publisher");
    }

    let result = bridge.run(events, shutdown).await;

    api.shutdown().await;
    driver.shutdown().await;
    tracing::info!("Bridge stopped");

    result.map_err(Into::into)
}
