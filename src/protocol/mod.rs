// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message broker transport.
//!
//! The publisher only needs four things from a broker connection: wait for
//! the first successful connect, tell whether the link is up right now,
//! publish a payload, and disconnect. [`BrokerTransport`] captures exactly
//! that; [`MqttTransport`] implements it over `rumqttc`.

#[cfg(feature = "mqtt")]
mod mqtt;

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use crate::error::ProtocolError;

/// Delay between two connection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Connection state of a broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link; a new attempt follows after [`RECONNECT_INTERVAL`].
    #[default]
    Disconnected,
    /// An attempt is in progress.
    Connecting,
    /// The broker acknowledged the connection.
    Connected,
}

impl ConnectionState {
    /// Returns true if the transport is connected.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// A connection to a message broker.
pub trait BrokerTransport: Send + Sync + 'static {
    /// Waits until the broker has accepted a connection.
    ///
    /// Retries indefinitely; callers race it against their own stop signal.
    fn connect(&self) -> impl Future<Output = ()> + Send;

    /// Returns whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Publishes `payload` on `topic` with at-least-once QoS.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the request cannot be handed to the broker.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the disconnect request fails.
    fn disconnect(&self) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
