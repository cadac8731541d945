// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the bridge.
//!
//! Errors are split by where they come from: the persisted configuration
//! document, the message broker, and the sensor driver. Only startup code
//! treats them as fatal; the dispatch and publisher loops log and move on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Loading or saving the configuration document failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Communication with the message broker failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The sensor driver reported a failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// A payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O failure (signal handlers, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors related to the persisted configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the document.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The document could not be written to disk.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Path of the document.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The document content is not valid.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the document.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The in-memory document could not be encoded.
    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors related to broker communication.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MQTT client request failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// A broker round-trip did not complete in time.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// The broker is not connected.
    #[error("broker is not connected")]
    NotConnected,
}

/// Errors reported by the sensor driver.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No sense dongle could be located.
    #[error("can't find sense device")]
    NotFound,

    /// The driver helper process could not be started.
    #[error("failed to start driver `{command}`: {source}")]
    SpawnFailed {
        /// Command line that failed.
        command: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The driver did not answer in time.
    #[error("driver did not answer within {0} ms")]
    Timeout(u64),

    /// The driver rejected a command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The driver's channel was closed.
    #[error("driver channel closed: {0}")]
    ChannelClosed(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
