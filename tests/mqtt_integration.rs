// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT transport using mockforge-mqtt.

#![cfg(feature = "mqtt")]

use std::sync::Arc;
use std::time::Duration;

use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use sensebridge::config::MqttSettings;
use sensebridge::protocol::{BrokerTransport, ConnectionState, MqttTransport};
use sensebridge::publisher::{Publisher, Topics};
use sensebridge::{SensorId, SensorRecord};
use tokio::time::{sleep, timeout};

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18950);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    // Give the broker time to bind.
    sleep(Duration::from_millis(500)).await;
}

fn settings(port: u16) -> MqttSettings {
    MqttSettings {
        client_id: format!("sensebridge-test-{port}"),
        hostname: "127.0.0.1".to_string(),
        port,
        sensor_topic: "gosense".to_string(),
        discovery_topic: "gosense_discovery".to_string(),
        ..MqttSettings::default()
    }
}

// ============================================================================
// Transport
// ============================================================================

mod transport {
    use super::*;

    #[tokio::test]
    async fn connect_to_broker() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let transport = MqttTransport::new(&settings(port));
        timeout(Duration::from_secs(5), transport.connect())
            .await
            .expect("connect timed out");

        assert!(transport.is_connected());
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn publish_retained() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let transport = MqttTransport::new(&settings(port));
        timeout(Duration::from_secs(5), transport.connect())
            .await
            .expect("connect timed out");

        let result = transport
            .publish("gosense/AA:BB", br#"{"state":"1"}"#.to_vec(), true)
            .await;
        assert!(result.is_ok(), "publish failed: {:?}", result.err());

        let result = transport
            .publish("gosense_discovery/binary_sensor/AA:BB/config", Vec::new(), true)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn disconnect_stops_the_connection() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let transport = MqttTransport::new(&settings(port));
        timeout(Duration::from_secs(5), transport.connect())
            .await
            .expect("connect timed out");

        transport.disconnect().await.unwrap();

        assert!(!transport.is_connected());
        let err = transport
            .publish("gosense/AA:BB", Vec::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, sensebridge::ProtocolError::NotConnected));
    }

    #[tokio::test]
    async fn reconnects_once_broker_appears() {
        let port = get_test_port();

        let transport = MqttTransport::new(&settings(port));
        sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_connected());

        start_mock_broker(port).await;

        timeout(Duration::from_secs(10), transport.connect())
            .await
            .expect("transport never reconnected");
        assert!(transport.is_connected());
    }
}

// ============================================================================
// Publisher over MQTT
// ============================================================================

mod publisher {
    use super::*;

    #[tokio::test]
    async fn publishes_and_closes() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let settings = settings(port);
        let transport = Arc::new(MqttTransport::new(&settings));
        let handle = Publisher::spawn(Arc::clone(&transport), Topics::from_settings(&settings));

        timeout(Duration::from_secs(5), transport.connect())
            .await
            .expect("connect timed out");

        let mut record = SensorRecord::new(SensorId::new("7779768D"));
        assert!(handle.submit_state(record.clone()).await);
        record
            .properties
            .insert("state".to_string(), "1".to_string());
        assert!(handle.submit_alarm(record).await);

        timeout(Duration::from_secs(10), handle.close())
            .await
            .expect("publisher did not close");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn drops_while_broker_is_unreachable() {
        let port = get_test_port();

        let settings = settings(port);
        let transport = Arc::new(MqttTransport::new(&settings));
        let handle = Publisher::spawn(Arc::clone(&transport), Topics::from_settings(&settings));

        let record = SensorRecord::new(SensorId::new("7779768D"));
        // The publisher is still connecting; the queue holds one entry.
        assert!(handle.submit_state(record).await);

        timeout(Duration::from_secs(10), handle.close())
            .await
            .expect("publisher did not close");
    }
}
