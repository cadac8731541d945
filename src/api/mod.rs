// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP query surface.
//!
//! | Route | Response |
//! |---|---|
//! | `GET /help` | route overview |
//! | `GET /sensors` | all records |
//! | `GET /sensors/scan` | pair a new sensor, then its record (or `null`) |
//! | `GET /sensors/{id}` | one record, 404 if unknown |
//! | `GET /sensors/{id}/remove` | unpair a sensor |
//! | `GET /hasensors` | Home Assistant `binary_sensor` configuration |
//!
//! Errors are JSON objects `{"code": 404, "message": "..."}`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::discovery::HomeAssistantConfig;
use crate::driver::SensorDriver;
use crate::error::Error;
use crate::registry::Registry;
use crate::types::SensorId;

/// Running HTTP server.
#[derive(Debug)]
pub struct ApiServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Binds `addr` and serves the routes in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the address cannot be bound.
    pub fn start<D: SensorDriver>(
        addr: SocketAddr,
        registry: Registry,
        driver: Arc<D>,
    ) -> Result<Self, Error> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let (local_addr, server) = warp::serve(routes(registry, driver))
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.await;
            })
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        tracing::info!(addr = %local_addr, "HTTP API listening");
        let server_handle = tokio::spawn(server);

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Returns the bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(mut self) {
        tracing::info!(addr = %self.local_addr, "Stopping HTTP API");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "HTTP API task failed");
        }
    }
}

/// Builds the route tree.
pub fn routes<D: SensorDriver>(
    registry: Registry,
    driver: Arc<D>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let help = warp::path("help")
        .and(warp::path::end())
        .and(warp::get())
        .map(help_banner);

    let list = warp::path("sensors")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .map(|registry: Registry| warp::reply::json(&registry.list()));

    let scan = warp::path!("sensors" / "scan")
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and(with_driver(Arc::clone(&driver)))
        .and_then(scan_sensor::<D>);

    let get = warp::path!("sensors" / String)
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and_then(get_sensor);

    let remove = warp::path!("sensors" / String / "remove")
        .and(warp::get())
        .and(with_driver(driver))
        .and_then(remove_sensor::<D>);

    let home_assistant = warp::path("hasensors")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_registry(registry))
        .map(home_assistant_config);

    help.or(list)
        .or(scan)
        .or(get)
        .or(remove)
        .or(home_assistant)
        .with(warp::trace::request())
        .recover(handle_rejection)
}

fn with_registry(
    registry: Registry,
) -> impl Filter<Extract = (Registry,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

fn with_driver<D: SensorDriver>(
    driver: Arc<D>,
) -> impl Filter<Extract = (Arc<D>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&driver))
}

fn help_banner() -> String {
    format!(
        "sensebridge {}\n\n\
         GET /help                  this message\n\
         GET /sensors               list all sensors\n\
         GET /sensors/scan          pair a new sensor\n\
         GET /sensors/{{id}}          show one sensor\n\
         GET /sensors/{{id}}/remove   unpair a sensor\n\
         GET /hasensors             Home Assistant binary_sensor configuration\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn decode_id(raw: &str) -> SensorId {
    match urlencoding::decode(raw) {
        Ok(decoded) => SensorId::new(decoded.into_owned()),
        Err(_) => SensorId::new(raw),
    }
}

async fn scan_sensor<D: SensorDriver>(
    registry: Registry,
    driver: Arc<D>,
) -> Result<warp::reply::Json, Rejection> {
    tracing::info!("Scanning for a new sensor");

    let id = driver.scan_sensor().await.map_err(|e| {
        tracing::warn!(error = %e, "Sensor scan failed");
        warp::reject::custom(ApiError::internal(e.to_string()))
    })?;

    tracing::info!(sensor = %id, "Sensor paired");
    Ok(warp::reply::json(&registry.get(&id)))
}

async fn get_sensor(raw_id: String, registry: Registry) -> Result<warp::reply::Json, Rejection> {
    let id = decode_id(&raw_id);
    match registry.get(&id) {
        Some(record) => Ok(warp::reply::json(&record)),
        None => Err(warp::reject::custom(ApiError::not_found(format!(
            "Sensor [{id}] not found"
        )))),
    }
}

async fn remove_sensor<D: SensorDriver>(
    raw_id: String,
    driver: Arc<D>,
) -> Result<warp::reply::Json, Rejection> {
    let id = decode_id(&raw_id);
    tracing::info!(sensor = %id, "Removing sensor");

    driver.delete_sensor(&id).await.map_err(|e| {
        tracing::warn!(sensor = %id, error = %e, "Sensor removal failed");
        warp::reject::custom(ApiError::internal(e.to_string()))
    })?;

    Ok(warp::reply::json(&""))
}

fn home_assistant_config(registry: Registry) -> warp::reply::Json {
    let guard = registry.lock();
    let config = HomeAssistantConfig::from_records(guard.sensor_topic(), guard.records());
    warp::reply::json(&config)
}

/// Rejection carrying a status and message for the client.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl warp::reject::Reject for ApiError {}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<ApiError>() {
        (e.status, e.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        tracing::error!(rejection = ?err, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    let body = ErrorBody {
        code: status.as_u16(),
        message,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
