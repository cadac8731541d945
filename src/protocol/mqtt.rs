// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport over `rumqttc`.
//!
//! The event loop runs in its own task for the lifetime of the transport.
//! Connection errors never end it: the state drops to
//! [`ConnectionState::Disconnected`], the task sleeps for
//! [`RECONNECT_INTERVAL`] and polls again, which makes `rumqttc` redial.
//!
//! # Examples
//!
//! ```no_run
//! use sensebridge::config::MqttSettings;
//! use sensebridge::protocol::{BrokerTransport, MqttTransport};
//!
//! # async fn example() -> sensebridge::Result<()> {
//! let settings = MqttSettings {
//!     hostname: "192.168.1.50".to_string(),
//!     port: 1883,
//!     client_id: "bridge".to_string(),
//!     ..MqttSettings::default()
//! };
//!
//! let transport = MqttTransport::new(&settings);
//! transport.connect().await;
//! transport.publish("gosense/AA:BB", b"{}".to_vec(), true).await?;
//! transport.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BrokerTransport, ConnectionState, RECONNECT_INTERVAL};
use crate::config::MqttSettings;
use crate::error::ProtocolError;

/// Keep-alive interval negotiated with the broker.
const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// How long `disconnect` waits for the event loop to flush the request.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the `rumqttc` request channel.
const REQUEST_CAPACITY: usize = 10;

/// A broker connection that keeps redialing until disconnected.
pub struct MqttTransport {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    server_uri: String,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Creates the client and starts its event loop.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.hostname, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        if let Some((user, password)) = settings.credentials() {
            options.set_credentials(user, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let server_uri = settings.server_uri();

        tracing::info!(server = %server_uri, client_id = %settings.client_id, "Connecting to MQTT broker");

        let event_task = tokio::spawn(drive_event_loop(event_loop, state_tx, server_uri.clone()));

        Self {
            client,
            state: state_rx,
            server_uri,
            event_task: Mutex::new(Some(event_task)),
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns the broker address in `tcp://host:port` form.
    #[must_use]
    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }
}

impl BrokerTransport for MqttTransport {
    async fn connect(&self) {
        let mut state = self.state.clone();
        let loop_alive = state.wait_for(|s| s.is_connected()).await.is_ok();
        if !loop_alive {
            // The event loop has ended; only `disconnect` does that.
            tracing::warn!(server = %self.server_uri, "MQTT event loop stopped before connecting");
            std::future::pending::<()>().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        tracing::info!(server = %self.server_uri, "Disconnecting from MQTT broker");

        let request = tokio::time::timeout(DISCONNECT_TIMEOUT, self.client.disconnect()).await;

        let task = self.event_task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err()
        {
            task.abort();
        }

        match request {
            Ok(result) => result.map_err(ProtocolError::Mqtt),
            Err(_) => Err(ProtocolError::Timeout(
                u64::try_from(DISCONNECT_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("server", &self.server_uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Polls the event loop until a disconnect request goes out.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    state: watch::Sender<ConnectionState>,
    server_uri: String,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::info!(server = %server_uri, ?connack, "Connected to MQTT broker");
                state.send_replace(ConnectionState::Connected);
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                tracing::trace!(pkid = puback.pkid, "Publish acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(server = %server_uri, "MQTT disconnect sent");
                state.send_replace(ConnectionState::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let previous = state.send_replace(ConnectionState::Disconnected);
                if previous.is_connected() {
                    tracing::warn!(server = %server_uri, error = %e, "MQTT connection lost");
                } else {
                    tracing::warn!(server = %server_uri, error = %e, "MQTT connection attempt failed");
                }

                tokio::time::sleep(RECONNECT_INTERVAL).await;
                state.send_replace(ConnectionState::Connecting);
            }
        }
    }
}
