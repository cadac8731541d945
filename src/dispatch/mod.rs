// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event dispatch loop.
//!
//! The [`Dispatcher`] is the only steady-state writer of the registry. It
//! takes one driver event at a time and, for each, mutates the registry,
//! persists the document and only then hands the resulting record to the
//! publisher. The registry lock is released before any submission.

use std::future::Future;

use crate::driver::{AlarmEvent, DriverEvents, PresenceEvent};
use crate::publisher::PublisherHandle;
use crate::registry::Registry;
use crate::types::{SensorRecord, SensorType};

/// Lifecycle of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    /// Taking events from the driver.
    #[default]
    Running,
    /// The loop has exited; the publisher may still hold submissions.
    Draining,
    /// The publisher is closed.
    Stopped,
}

/// Applies driver events to the registry and forwards them to the publisher.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Registry,
    publisher: Option<PublisherHandle>,
    state: DispatchState,
}

impl Dispatcher {
    /// Creates a dispatcher. Without a publisher, events only update the
    /// registry.
    #[must_use]
    pub fn new(registry: Registry, publisher: Option<PublisherHandle>) -> Self {
        Self {
            registry,
            publisher,
            state: DispatchState::Running,
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Processes events until `shutdown` resolves or both streams close,
    /// leaving the dispatcher [`Draining`](DispatchState::Draining).
    pub async fn run<S>(&mut self, mut events: DriverEvents, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.state = DispatchState::Running;
        tracing::info!("Dispatch loop started");

        let mut alarms_open = true;
        let mut presence_open = true;

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested, leaving dispatch loop");
                    break;
                }
                alarm = events.alarms.recv(), if alarms_open => match alarm {
                    Some(alarm) => self.handle_alarm(alarm).await,
                    None => {
                        tracing::warn!("Alarm stream closed");
                        alarms_open = false;
                    }
                },
                presence = events.presence.recv(), if presence_open => match presence {
                    Some(presence) => self.handle_presence(presence).await,
                    None => {
                        tracing::warn!("Presence stream closed");
                        presence_open = false;
                    }
                },
            }

            if !alarms_open && !presence_open {
                tracing::warn!("Driver event streams closed, leaving dispatch loop");
                break;
            }
        }

        self.state = DispatchState::Draining;
        tracing::debug!("Dispatch loop draining");
    }

    /// Closes the publisher after [`run`](Self::run), flushing what it has
    /// queued.
    pub async fn finish(&mut self) {
        if let Some(publisher) = &self.publisher {
            publisher.close().await;
        }
        self.state = DispatchState::Stopped;
        tracing::info!("Dispatch loop stopped");
    }

    /// Applies one alarm.
    ///
    /// Only [`ALARM_FLAG_TRIGGER`](crate::driver::ALARM_FLAG_TRIGGER) alarms
    /// for registered sensors change anything.
    pub async fn handle_alarm(&self, alarm: AlarmEvent) {
        tracing::debug!(
            sensor = %alarm.mac,
            state = alarm.state,
            battery = alarm.battery,
            signal = alarm.signal,
            flags = alarm.flags,
            "Alarm received"
        );

        if !alarm.is_trigger() {
            tracing::debug!(sensor = %alarm.mac, flags = alarm.flags, "Ignoring alarm flag");
            return;
        }

        let record = {
            let mut guard = self.registry.lock();
            let Some(record) = guard.get_mut(&alarm.mac) else {
                tracing::warn!(sensor = %alarm.mac, "Alarm from unregistered sensor, dropping");
                return;
            };
            record.metadata.sensor_type = alarm.sensor_type;
            record.apply_alarm_readings(alarm.state, alarm.battery, alarm.signal, alarm.timestamp);
            let updated = record.clone();
            guard.persist();
            updated
        };

        tracing::info!(sensor = %record.id(), state = alarm.state, "Sensor state updated");

        if let Some(publisher) = &self.publisher {
            publisher.submit_alarm(record).await;
        }
    }

    /// Applies one presence change.
    pub async fn handle_presence(&self, event: PresenceEvent) {
        let record = {
            let mut guard = self.registry.lock();
            let record = if event.present {
                guard
                    .upsert(&event.mac, |record| {
                        record.metadata.present = true;
                        if record.metadata.sensor_type == SensorType::Unknown {
                            record.metadata.sensor_type = event.sensor_type;
                        }
                    })
                    .clone()
            } else {
                let mut removed = guard
                    .remove(&event.mac)
                    .unwrap_or_else(|| SensorRecord::new(event.mac.clone()));
                removed.metadata.present = false;
                removed
            };
            guard.persist();
            record
        };

        if event.present {
            tracing::info!(sensor = %event.mac, sensor_type = %event.sensor_type, "Sensor added");
        } else {
            tracing::info!(sensor = %event.mac, "Sensor removed");
        }

        if let Some(publisher) = &self.publisher {
            publisher.submit_state(record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::{AppConfig, MemoryStore};
    use crate::driver::{ALARM_FLAG_TRIGGER, event_channels};
    use crate::publisher::{Publisher, Topics};
    use crate::testing::RecordingTransport;
    use crate::types::{PROP_BATTERY, PROP_SIGNAL, PROP_STATE, PROP_TIME_LAST_ALARM, SensorId};

    fn registry() -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        (Registry::new(AppConfig::default(), Arc::clone(&store)), store)
    }

    fn topics() -> Topics {
        Topics {
            sensor_root: "gosense".to_string(),
            discovery_root: "gosense_discovery".to_string(),
        }
    }

    fn presence(id: &str, present: bool) -> PresenceEvent {
        PresenceEvent {
            mac: SensorId::new(id),
            sensor_type: SensorType::Switch,
            present,
        }
    }

    fn alarm(id: &str, state: u8, flags: u8) -> AlarmEvent {
        AlarmEvent {
            mac: SensorId::new(id),
            sensor_type: SensorType::Switch,
            state,
            battery: 95,
            signal: -48,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            flags,
        }
    }

    #[tokio::test]
    async fn presence_true_creates_record() {
        let (registry, store) = registry();
        let dispatcher = Dispatcher::new(registry.clone(), None);

        dispatcher.handle_presence(presence("7779768D", true)).await;

        let record = registry.get(&SensorId::new("7779768D")).unwrap();
        assert!(record.is_present());
        assert_eq!(record.metadata.sensor_type, SensorType::Switch);
        assert!(record.properties.is_empty());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn presence_true_keeps_properties_and_type() {
        let (registry, _) = registry();
        {
            let mut guard = registry.lock();
            guard.upsert(&SensorId::new("AA"), |record| {
                record.metadata.present = false;
                record.metadata.sensor_type = SensorType::Motion;
                record.properties.insert(PROP_STATE.to_string(), "1".to_string());
            });
        }
        let dispatcher = Dispatcher::new(registry.clone(), None);

        dispatcher.handle_presence(presence("AA", true)).await;

        let record = registry.get(&SensorId::new("AA")).unwrap();
        assert!(record.is_present());
        assert_eq!(record.metadata.sensor_type, SensorType::Motion);
        assert_eq!(record.property(PROP_STATE), Some("1"));
    }

    #[tokio::test]
    async fn presence_false_removes_record() {
        let (registry, store) = registry();
        let dispatcher = Dispatcher::new(registry.clone(), None);

        dispatcher.handle_presence(presence("AA", true)).await;
        dispatcher.handle_presence(presence("AA", false)).await;

        assert!(registry.is_empty());
        assert_eq!(store.save_count(), 2);
        assert!(store.document().unwrap().sensors.is_empty());
    }

    #[tokio::test]
    async fn registry_tracks_latest_presence() {
        let (registry, _) = registry();
        let dispatcher = Dispatcher::new(registry.clone(), None);

        for (id, present) in [
            ("A", true),
            ("B", true),
            ("A", false),
            ("C", true),
            ("B", false),
            ("A", true),
            ("D", false),
        ] {
            dispatcher.handle_presence(presence(id, present)).await;
        }

        let ids: Vec<String> = registry.list().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, ["A", "C"]);
    }

    #[tokio::test]
    async fn trigger_alarm_updates_properties() {
        let (registry, store) = registry();
        let dispatcher = Dispatcher::new(registry.clone(), None);
        dispatcher.handle_presence(presence("AA", true)).await;

        let mut event = alarm("AA", 1, ALARM_FLAG_TRIGGER);
        event.sensor_type = SensorType::Motion;
        dispatcher.handle_alarm(event).await;

        let record = registry.get(&SensorId::new("AA")).unwrap();
        assert_eq!(record.metadata.sensor_type, SensorType::Motion);
        assert_eq!(record.property(PROP_STATE), Some("1"));
        assert_eq!(record.property(PROP_BATTERY), Some("95"));
        assert_eq!(record.property(PROP_SIGNAL), Some("-48"));
        assert_eq!(
            record.property(PROP_TIME_LAST_ALARM),
            Some("2024-03-01T12:30:00Z")
        );
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn other_flags_are_ignored() {
        let (registry, store) = registry();
        let transport = RecordingTransport::connected();
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let dispatcher = Dispatcher::new(registry.clone(), Some(publisher.clone()));
        dispatcher.handle_presence(presence("AA", true)).await;
        let saves = store.save_count();

        dispatcher.handle_alarm(alarm("AA", 1, 0xA1)).await;
        dispatcher.handle_alarm(alarm("AA", 1, 0x00)).await;
        publisher.close().await;

        let record = registry.get(&SensorId::new("AA")).unwrap();
        assert!(record.properties.is_empty());
        assert_eq!(store.save_count(), saves);
        assert!(!transport.topics().contains(&"gosense/AA".to_string()));
    }

    #[tokio::test]
    async fn alarm_for_unknown_sensor_is_dropped() {
        let (registry, store) = registry();
        let transport = RecordingTransport::connected();
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let dispatcher = Dispatcher::new(registry.clone(), Some(publisher.clone()));

        dispatcher.handle_alarm(alarm("ZZ", 1, ALARM_FLAG_TRIGGER)).await;
        publisher.close().await;

        assert!(registry.is_empty());
        assert_eq!(store.save_count(), 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn persist_happens_before_publish() {
        let (registry, store) = registry();
        let transport = RecordingTransport::observing(Arc::clone(&store));
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let dispatcher = Dispatcher::new(registry.clone(), Some(publisher.clone()));

        dispatcher.handle_presence(presence("AA", true)).await;
        dispatcher.handle_alarm(alarm("AA", 1, ALARM_FLAG_TRIGGER)).await;
        publisher.close().await;

        let published = transport.published();
        assert_eq!(published.len(), 3);
        // Discovery clear + announce follow the first save.
        assert!(published[0].saves.unwrap() >= 1);
        assert!(published[1].saves.unwrap() >= 1);
        // The alarm publish follows the second save.
        assert_eq!(published[2].topic, "gosense/AA");
        assert_eq!(published[2].saves, Some(2));
    }

    #[tokio::test]
    async fn persist_failure_still_publishes() {
        let (registry, store) = registry();
        store.fail_saves(true);
        let transport = RecordingTransport::connected();
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let dispatcher = Dispatcher::new(registry.clone(), Some(publisher.clone()));

        dispatcher.handle_presence(presence("AA", true)).await;
        publisher.close().await;

        assert_eq!(registry.len(), 1);
        assert_eq!(store.save_count(), 1);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let (registry, _) = registry();
        let transport = RecordingTransport::connected();
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let dispatcher = Dispatcher::new(registry.clone(), Some(publisher.clone()));
        let discovery = "gosense_discovery/binary_sensor/7779768D/config";

        // Presence add.
        dispatcher.handle_presence(presence("7779768D", true)).await;
        // Alarm update.
        dispatcher
            .handle_alarm(alarm("7779768D", 1, ALARM_FLAG_TRIGGER))
            .await;
        // Presence remove.
        dispatcher.handle_presence(presence("7779768D", false)).await;
        publisher.close().await;

        let published = transport.published();
        let topics: Vec<&str> = published.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(
            topics,
            [discovery, discovery, "gosense/7779768D", discovery]
        );
        assert!(published[0].payload.is_empty());
        assert!(!published[1].payload.is_empty());
        assert!(published[3].payload.is_empty());
        assert!(published.iter().all(|p| p.retain));

        let event: SensorRecord = serde_json::from_slice(&published[2].payload).unwrap();
        assert_eq!(event.property(PROP_STATE), Some("1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (registry, _) = registry();
        let (senders, events) = event_channels();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut dispatcher = Dispatcher::new(registry.clone(), None);

        let task = tokio::spawn(async move {
            dispatcher
                .run(events, async {
                    let _ = stop_rx.await;
                })
                .await;
            dispatcher
        });

        senders.presence.send(presence("AA", true)).await.unwrap();
        // Wait until the event is applied.
        for _ in 0..100 {
            if !registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(()).unwrap();

        let mut dispatcher = task.await.unwrap();
        assert_eq!(dispatcher.state(), DispatchState::Draining);
        dispatcher.finish().await;
        assert_eq!(dispatcher.state(), DispatchState::Stopped);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn finish_flushes_and_closes_publisher() {
        let (registry, _) = registry();
        let (senders, events) = event_channels();
        let transport = RecordingTransport::connected();
        let publisher = Publisher::spawn(Arc::clone(&transport), topics());
        let mut dispatcher = Dispatcher::new(registry, Some(publisher));
        drop(senders);

        dispatcher.handle_presence(presence("AA", false)).await;
        dispatcher.run(events, std::future::pending()).await;
        assert_eq!(dispatcher.state(), DispatchState::Draining);

        dispatcher.finish().await;

        assert_eq!(dispatcher.state(), DispatchState::Stopped);
        assert_eq!(transport.topics(), ["gosense_discovery/binary_sensor/AA/config"]);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_when_streams_close() {
        let (registry, _) = registry();
        let (senders, events) = event_channels();
        let mut dispatcher = Dispatcher::new(registry, None);
        drop(senders);

        tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.run(events, std::future::pending()),
        )
        .await
        .unwrap();
        assert_eq!(dispatcher.state(), DispatchState::Draining);
    }
}
