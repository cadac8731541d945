// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forwarding sensor state to the message broker.
//!
//! The publisher owns a [`BrokerTransport`] and drains two single-slot
//! queues in one task:
//!
//! - **state**: a sensor appeared or disappeared. The retained discovery
//!   block is cleared, then republished if the sensor is present.
//! - **alarm**: a sensor reported. The whole record is published retained
//!   on the sensor's event topic.
//!
//! Delivery is at-most-once. While the broker is unreachable, submissions
//! are logged and dropped; nothing is replayed after reconnecting.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::MqttSettings;
use crate::discovery::{BinarySensorConfig, discovery_topic, state_topic};
use crate::protocol::BrokerTransport;
use crate::types::SensorRecord;

/// Capacity of each submission queue.
pub const SUBMISSION_QUEUE_CAPACITY: usize = 1;

/// How long a producer waits for queue capacity before dropping a submission.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single broker publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic roots used by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Root of the per-sensor event topics.
    pub sensor_root: String,
    /// Root of the discovery topics.
    pub discovery_root: String,
}

impl Topics {
    /// Takes the topic roots from the broker settings.
    #[must_use]
    pub fn from_settings(settings: &MqttSettings) -> Self {
        Self {
            sensor_root: settings.sensor_topic.clone(),
            discovery_root: settings.discovery_topic.clone(),
        }
    }
}

/// Which queue a submission goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    State,
    Alarm,
}

impl Queue {
    fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Alarm => "alarm",
        }
    }
}

struct Control {
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Producer side of a running publisher.
///
/// Cloning is cheap; all clones feed the same publisher task.
#[derive(Clone)]
pub struct PublisherHandle {
    state_tx: mpsc::Sender<SensorRecord>,
    alarm_tx: mpsc::Sender<SensorRecord>,
    control: Arc<Control>,
}

impl PublisherHandle {
    /// Submits a presence change, waiting at most [`SUBMIT_TIMEOUT`].
    ///
    /// Returns `false` if the submission was dropped.
    pub async fn submit_state(&self, record: SensorRecord) -> bool {
        submit(&self.state_tx, Queue::State, record).await
    }

    /// Submits an alarm update, waiting at most [`SUBMIT_TIMEOUT`].
    ///
    /// Returns `false` if the submission was dropped.
    pub async fn submit_alarm(&self, record: SensorRecord) -> bool {
        submit(&self.alarm_tx, Queue::Alarm, record).await
    }

    /// Waits, without a deadline, for room in the state queue.
    ///
    /// The slot is held until it is used or dropped, so a record chosen after
    /// reserving is queued ahead of any submission made later. Returns `None`
    /// once the publisher has stopped.
    pub async fn reserve_state(&self) -> Option<StateSlot> {
        self.state_tx
            .clone()
            .reserve_owned()
            .await
            .ok()
            .map(StateSlot)
    }

    /// Stops the publisher task and waits for it to disconnect.
    ///
    /// Submissions already queued are published first. Calling `close` more
    /// than once is harmless.
    pub async fn close(&self) {
        let stop = self.control.stop.lock().take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let task = self.control.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Publisher task failed");
        }
    }
}

/// A reserved place in the state queue.
#[derive(Debug)]
pub struct StateSlot(mpsc::OwnedPermit<SensorRecord>);

impl StateSlot {
    /// Queues `record` in the reserved place.
    pub fn submit(self, record: SensorRecord) {
        self.0.send(record);
    }
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("closed", &self.state_tx.is_closed())
            .finish_non_exhaustive()
    }
}

async fn submit(tx: &mpsc::Sender<SensorRecord>, queue: Queue, record: SensorRecord) -> bool {
    let sensor = record.id().clone();
    match tx.send_timeout(record, SUBMIT_TIMEOUT).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            tracing::warn!(
                sensor = %sensor,
                queue = queue.as_str(),
                "Publisher busy, dropping submission"
            );
            false
        }
        Err(SendTimeoutError::Closed(_)) => {
            tracing::warn!(
                sensor = %sensor,
                queue = queue.as_str(),
                "Publisher closed, dropping submission"
            );
            false
        }
    }
}

/// The publisher task.
pub struct Publisher<T> {
    transport: Arc<T>,
    topics: Topics,
    state_rx: mpsc::Receiver<SensorRecord>,
    alarm_rx: mpsc::Receiver<SensorRecord>,
}

impl<T: BrokerTransport> Publisher<T> {
    /// Starts a publisher on `transport` and returns its handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(transport: Arc<T>, topics: Topics) -> PublisherHandle {
        let (state_tx, state_rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let (alarm_tx, alarm_rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();

        let publisher = Self {
            transport,
            topics,
            state_rx,
            alarm_rx,
        };
        let task = tokio::spawn(publisher.run(stop_rx));

        PublisherHandle {
            state_tx,
            alarm_tx,
            control: Arc::new(Control {
                stop: Mutex::new(Some(stop_tx)),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        tokio::select! {
            () = self.transport.connect() => {
                tracing::info!("Publisher connected");
            }
            _ = &mut stop => {
                tracing::info!("Publisher stopped before connecting");
                self.disconnect().await;
                return;
            }
        }

        loop {
            tokio::select! {
                biased;

                Some(record) = self.state_rx.recv() => self.publish_state(&record).await,
                Some(record) = self.alarm_rx.recv() => self.publish_alarm(&record).await,
                _ = &mut stop => break,
            }
        }

        tracing::info!("Publisher stopping");
        self.disconnect().await;
    }

    async fn publish_state(&self, record: &SensorRecord) {
        let topic = discovery_topic(&self.topics.discovery_root, record.id());
        let config = BinarySensorConfig::from_record(&self.topics.sensor_root, record);
        let payload = match serde_json::to_vec(&config) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(sensor = %record.id(), error = %e, "Failed to encode discovery block");
                return;
            }
        };

        if !self.transport.is_connected() {
            tracing::info!(sensor = %record.id(), "Broker disconnected, dropping discovery update");
            return;
        }

        // Clear the retained block first so a removed sensor disappears.
        self.publish(&topic, Vec::new()).await;
        if record.is_present() {
            self.publish(&topic, payload).await;
        }
    }

    async fn publish_alarm(&self, record: &SensorRecord) {
        let topic = state_topic(&self.topics.sensor_root, record.id());
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(sensor = %record.id(), error = %e, "Failed to encode sensor record");
                return;
            }
        };

        if !self.transport.is_connected() {
            tracing::info!(sensor = %record.id(), "Broker disconnected, dropping alarm");
            return;
        }

        self.publish(&topic, payload).await;
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) {
        let size = payload.len();
        match tokio::time::timeout(PUBLISH_TIMEOUT, self.transport.publish(topic, payload, true))
            .await
        {
            Ok(Ok(())) => tracing::debug!(topic = %topic, size, "Published"),
            Ok(Err(e)) => tracing::warn!(topic = %topic, error = %e, "Publish failed"),
            Err(_) => tracing::warn!(
                topic = %topic,
                timeout_secs = PUBLISH_TIMEOUT.as_secs(),
                "Publish timed out"
            ),
        }
    }

    async fn disconnect(&self) {
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "Broker disconnect failed");
        }
    }
}
