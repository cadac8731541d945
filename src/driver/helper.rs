// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver backed by a helper process speaking JSON lines.
//!
//! The helper owns the dongle. Each line it prints is one JSON object tagged
//! by `type`: device events (`alarm`, `presence`) go to the event channels,
//! replies (`sensorList`, `scanResult`, `deleteResult`) answer the commands
//! written to its stdin.
//!
//! One task reads the helper's output. It never waits on the event channels:
//! events the dispatcher has not taken yet are held in a bounded backlog, so
//! a reply is delivered even while nobody reads events (during startup
//! reconciliation, for instance).

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::DriverSettings;
use crate::error::DeviceError;
use crate::types::SensorId;

use super::{AlarmEvent, EventSenders, PresenceEvent, SensorDriver};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Pairing waits for a human to press the sensor button.
const SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Replies buffered for `request`.
const REPLY_QUEUE_CAPACITY: usize = 4;

/// Events held per stream while the event channel is full.
const EVENT_BACKLOG_LIMIT: usize = 1024;

/// One line printed by the helper.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum HelperMessage {
    Alarm(AlarmEvent),
    Presence(PresenceEvent),
    SensorList {
        sensors: Vec<SensorId>,
    },
    ScanResult {
        #[serde(default)]
        mac: Option<SensorId>,
        #[serde(default)]
        error: Option<String>,
    },
    DeleteResult {
        #[serde(default)]
        error: Option<String>,
    },
}

/// One line written to the helper.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
enum HelperCommand<'a> {
    List,
    Scan,
    Delete { mac: &'a SensorId },
}

#[derive(Debug)]
enum DriverReply {
    SensorList(Vec<SensorId>),
    Scan(Result<SensorId, String>),
    Delete(Option<String>),
}

impl DriverReply {
    fn answers(&self, command: &HelperCommand<'_>) -> bool {
        matches!(
            (self, command),
            (Self::SensorList(_), HelperCommand::List)
                | (Self::Scan(_), HelperCommand::Scan)
                | (Self::Delete(_), HelperCommand::Delete { .. })
        )
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// [`SensorDriver`] talking to a helper process over stdin/stdout.
pub struct HelperDriver {
    writer: Mutex<BoxedWriter>,
    replies: Mutex<mpsc::Receiver<DriverReply>>,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
}

impl HelperDriver {
    /// Starts the helper for the dongle at `device`.
    ///
    /// `settings.command` is split on whitespace; the device path is passed
    /// as the last argument.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::SpawnFailed` if the process cannot be started.
    pub fn spawn(
        settings: &DriverSettings,
        device: &Path,
        events: EventSenders,
    ) -> Result<Self, DeviceError> {
        let mut parts = settings.command.split_whitespace();
        let program = parts.next().ok_or_else(|| DeviceError::SpawnFailed {
            command: settings.command.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(device)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::SpawnFailed {
                command: settings.command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DeviceError::ChannelClosed(
                "helper stdio not captured".to_string(),
            ));
        };

        tracing::info!(
            command = %settings.command,
            device = %device.display(),
            "Started sensor driver helper"
        );

        let mut driver = Self::from_io(stdout, stdin, events);
        driver.child = Mutex::new(Some(child));
        Ok(driver)
    }

    /// Builds a driver over an existing reader/writer pair.
    #[must_use]
    pub fn from_io<R, W>(reader: R, writer: W, events: EventSenders) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_helper_output(reader, events, reply_tx));

        Self {
            writer: Mutex::new(Box::new(writer)),
            replies: Mutex::new(reply_rx),
            child: Mutex::new(None),
            reader,
        }
    }

    /// Stops the helper process and the output reader.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            tracing::warn!(error = %e, "Failed to stop driver helper");
        }
        self.reader.abort();
    }

    /// Sends a command and waits for its reply.
    ///
    /// Replies to other commands arriving in the meantime are discarded.
    async fn request(
        &self,
        command: &HelperCommand<'_>,
        timeout: Duration,
    ) -> Result<DriverReply, DeviceError> {
        let mut replies = self.replies.lock().await;

        // Replies to commands that already timed out
        let mut stale = 0;
        while replies.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(count = stale, "Drained stale driver replies");
        }

        self.write_command(command).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reply = tokio::time::timeout_at(deadline, replies.recv())
                .await
                .map_err(|_| {
                    DeviceError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
                })?
                .ok_or_else(|| DeviceError::ChannelClosed("driver helper exited".to_string()))?;

            if reply.answers(command) {
                return Ok(reply);
            }
            tracing::debug!(?reply, ?command, "Discarding reply to an earlier command");
        }
    }

    async fn write_command(&self, command: &HelperCommand<'_>) -> Result<(), DeviceError> {
        let mut line = serde_json::to_vec(command)
            .map_err(|e| DeviceError::Rejected(format!("cannot encode command: {e}")))?;
        line.push(b'\n');

        tracing::debug!(?command, "Sending driver command");

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| DeviceError::ChannelClosed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| DeviceError::ChannelClosed(e.to_string()))
    }
}

impl SensorDriver for HelperDriver {
    async fn list_sensors(&self) -> Result<Vec<SensorId>, DeviceError> {
        match self.request(&HelperCommand::List, REQUEST_TIMEOUT).await? {
            DriverReply::SensorList(sensors) => Ok(sensors),
            other => Err(unexpected(&other)),
        }
    }

    async fn scan_sensor(&self) -> Result<SensorId, DeviceError> {
        match self.request(&HelperCommand::Scan, SCAN_TIMEOUT).await? {
            DriverReply::Scan(result) => result.map_err(DeviceError::Rejected),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_sensor(&self, id: &SensorId) -> Result<(), DeviceError> {
        let command = HelperCommand::Delete { mac: id };
        match self.request(&command, REQUEST_TIMEOUT).await? {
            DriverReply::Delete(None) => Ok(()),
            DriverReply::Delete(Some(error)) => Err(DeviceError::Rejected(error)),
            other => Err(unexpected(&other)),
        }
    }
}

impl std::fmt::Debug for HelperDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperDriver")
            .field("running", &!self.reader.is_finished())
            .finish_non_exhaustive()
    }
}

fn unexpected(reply: &DriverReply) -> DeviceError {
    DeviceError::Rejected(format!("unexpected driver reply: {reply:?}"))
}

/// Device events waiting for room in their channel.
struct Backlog<T> {
    tx: mpsc::Sender<T>,
    queue: VecDeque<T>,
    stream: &'static str,
}

impl<T> Backlog<T> {
    fn new(tx: mpsc::Sender<T>, stream: &'static str) -> Self {
        Self {
            tx,
            queue: VecDeque::new(),
            stream,
        }
    }

    fn is_waiting(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Forwards `event`, or queues it behind the events already waiting.
    fn push(&mut self, event: T) {
        let event = if self.queue.is_empty() {
            match self.tx.try_send(event) {
                // A closed channel means the consumer is gone.
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(event)) => event,
            }
        } else {
            event
        };

        if self.queue.len() >= EVENT_BACKLOG_LIMIT {
            tracing::warn!(stream = self.stream, "Driver event backlog full, dropping event");
            return;
        }
        self.queue.push_back(event);
    }

    fn forward(&mut self, permit: Result<mpsc::OwnedPermit<T>, mpsc::error::SendError<()>>) {
        match permit {
            Ok(permit) => {
                if let Some(event) = self.queue.pop_front() {
                    permit.send(event);
                }
            }
            Err(_) => self.queue.clear(),
        }
    }
}

fn deliver_reply(replies: &mpsc::Sender<DriverReply>, reply: DriverReply) {
    if let Err(TrySendError::Full(reply)) = replies.try_send(reply) {
        tracing::warn!(?reply, "Driver reply queue full, dropping reply");
    }
}

/// Routes helper output until the helper closes its stdout.
async fn read_helper_output<R>(reader: R, events: EventSenders, replies: mpsc::Sender<DriverReply>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut alarms = Backlog::new(events.alarms, "alarm");
    let mut presence = Backlog::new(events.presence, "presence");

    loop {
        let next = tokio::select! {
            next = lines.next_line() => next,
            permit = alarms.tx.clone().reserve_owned(), if alarms.is_waiting() => {
                alarms.forward(permit);
                continue;
            }
            permit = presence.tx.clone().reserve_owned(), if presence.is_waiting() => {
                presence.forward(permit);
                continue;
            }
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::warn!("Driver helper closed its output");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read driver helper output");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<HelperMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Ignoring malformed driver message");
                continue;
            }
        };

        match message {
            HelperMessage::Alarm(alarm) => alarms.push(alarm),
            HelperMessage::Presence(event) => presence.push(event),
            HelperMessage::SensorList { sensors } => {
                deliver_reply(&replies, DriverReply::SensorList(sensors));
            }
            HelperMessage::ScanResult { mac, error } => {
                let result = match (mac, error) {
                    (Some(mac), None) => Ok(mac),
                    (_, Some(error)) => Err(error),
                    (None, None) => Err("no sensor found".to_string()),
                };
                deliver_reply(&replies, DriverReply::Scan(result));
            }
            HelperMessage::DeleteResult { error } => {
                deliver_reply(&replies, DriverReply::Delete(error));
            }
        }
    }

    // Hand over what is still held back before the senders go away.
    for event in alarms.queue.drain(..) {
        if alarms.tx.send(event).await.is_err() {
            break;
        }
    }
    for event in presence.queue.drain(..) {
        if presence.tx.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EVENT_QUEUE_CAPACITY, event_channels};
    use crate::types::SensorType;
    use tokio::io::{DuplexStream, duplex};

    /// Returns the driver plus the helper's side of both pipes.
    fn driver() -> (
        HelperDriver,
        crate::driver::DriverEvents,
        DuplexStream,
        tokio::io::Lines<BufReader<DuplexStream>>,
    ) {
        let (senders, events) = event_channels();
        let (helper_out, driver_in) = duplex(4096);
        let (driver_out, helper_in) = duplex(4096);
        let driver = HelperDriver::from_io(driver_in, driver_out, senders);
        (driver, events, helper_out, BufReader::new(helper_in).lines())
    }

    #[tokio::test]
    async fn routes_device_events() {
        let (_driver, mut events, mut helper_out, _) = driver();

        helper_out
            .write_all(
                b"{\"type\":\"presence\",\"mac\":\"AA:BB\",\"sensorType\":2,\"present\":true}\n\
                  not json\n\
                  {\"type\":\"alarm\",\"mac\":\"AA:BB\",\"sensorType\":2,\"state\":1,\"battery\":90,\
                  \"signal\":-60,\"timestamp\":\"2024-03-01T12:30:00Z\",\"flags\":162}\n",
            )
            .await
            .unwrap();

        let presence = events.presence.recv().await.unwrap();
        assert_eq!(presence.mac.as_str(), "AA:BB");
        assert_eq!(presence.sensor_type, SensorType::Motion);
        assert!(presence.present);

        let alarm = events.alarms.recv().await.unwrap();
        assert!(alarm.is_trigger());
        assert_eq!(alarm.signal, -60);
    }

    #[tokio::test]
    async fn list_sensors_round_trip() {
        let (driver, _events, mut helper_out, mut helper_in) = driver();

        let helper = tokio::spawn(async move {
            let command = helper_in.next_line().await.unwrap().unwrap();
            assert_eq!(command, r#"{"command":"list"}"#);
            helper_out
                .write_all(b"{\"type\":\"sensorList\",\"sensors\":[\"AA:BB\",\"CC:DD\"]}\n")
                .await
                .unwrap();
            (helper_out, helper_in)
        });

        let sensors = driver.list_sensors().await.unwrap();
        assert_eq!(sensors, vec![SensorId::new("AA:BB"), SensorId::new("CC:DD")]);
        helper.await.unwrap();
    }

    #[tokio::test]
    async fn delete_error_is_rejected() {
        let (driver, _events, mut helper_out, mut helper_in) = driver();

        let helper = tokio::spawn(async move {
            let command = helper_in.next_line().await.unwrap().unwrap();
            assert_eq!(command, r#"{"command":"delete","mac":"AA:BB"}"#);
            helper_out
                .write_all(b"{\"type\":\"deleteResult\",\"error\":\"unknown sensor\"}\n")
                .await
                .unwrap();
            (helper_out, helper_in)
        });

        let err = driver.delete_sensor(&SensorId::new("AA:BB")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(ref msg) if msg == "unknown sensor"));
        helper.await.unwrap();
    }

    #[tokio::test]
    async fn scan_returns_new_sensor() {
        let (driver, _events, mut helper_out, mut helper_in) = driver();

        let helper = tokio::spawn(async move {
            let command = helper_in.next_line().await.unwrap().unwrap();
            assert_eq!(command, r#"{"command":"scan"}"#);
            helper_out
                .write_all(b"{\"type\":\"scanResult\",\"mac\":\"EE:FF\"}\n")
                .await
                .unwrap();
            (helper_out, helper_in)
        });

        assert_eq!(driver.scan_sensor().await.unwrap(), SensorId::new("EE:FF"));
        helper.await.unwrap();
    }

    #[tokio::test]
    async fn list_reply_overtakes_unread_events() {
        let (driver, mut events, mut helper_out, mut helper_in) = driver();

        let helper = tokio::spawn(async move {
            let command = helper_in.next_line().await.unwrap().unwrap();
            assert_eq!(command, r#"{"command":"list"}"#);
            let mut output = String::new();
            for i in 0..=EVENT_QUEUE_CAPACITY + 5 {
                output.push_str(&format!(
                    "{{\"type\":\"presence\",\"mac\":\"S{i:02}\",\"sensorType\":1,\"present\":true}}\n"
                ));
            }
            output.push_str("{\"type\":\"sensorList\",\"sensors\":[\"S00\"]}\n");
            helper_out.write_all(output.as_bytes()).await.unwrap();
            (helper_out, helper_in)
        });

        // Nobody reads events while the list is pending.
        let sensors = driver.list_sensors().await.unwrap();
        assert_eq!(sensors, vec![SensorId::new("S00")]);
        let _pipes = helper.await.unwrap();

        for i in 0..=EVENT_QUEUE_CAPACITY + 5 {
            let presence = events.presence.recv().await.unwrap();
            assert_eq!(presence.mac, SensorId::new(format!("S{i:02}")));
        }
    }

    #[tokio::test]
    async fn late_scan_reply_is_skipped() {
        let (driver, _events, mut helper_out, mut helper_in) = driver();

        let helper = tokio::spawn(async move {
            let command = helper_in.next_line().await.unwrap().unwrap();
            assert_eq!(command, r#"{"command":"delete","mac":"AA:BB"}"#);
            helper_out
                .write_all(
                    b"{\"type\":\"scanResult\",\"mac\":\"EE:FF\"}\n\
                      {\"type\":\"deleteResult\"}\n",
                )
                .await
                .unwrap();
            (helper_out, helper_in)
        });

        driver.delete_sensor(&SensorId::new("AA:BB")).await.unwrap();
        helper.await.unwrap();
    }

    #[tokio::test]
    async fn unclaimed_replies_do_not_hold_up_events() {
        let (_driver, mut events, mut helper_out, _helper_in) = driver();

        let mut output = String::new();
        for _ in 0..REPLY_QUEUE_CAPACITY * 2 {
            output.push_str("{\"type\":\"deleteResult\"}\n");
        }
        output.push_str("{\"type\":\"presence\",\"mac\":\"AA:BB\",\"sensorType\":1,\"present\":false}\n");
        helper_out.write_all(output.as_bytes()).await.unwrap();

        let presence = tokio::time::timeout(Duration::from_secs(5), events.presence.recv())
            .await
            .expect("presence event held up")
            .unwrap();
        assert!(!presence.present);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_helper_times_out() {
        let (driver, _events, _helper_out, _helper_in) = driver();

        let err = driver.list_sensors().await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(5000)));
    }

    #[tokio::test]
    async fn closed_helper_is_reported() {
        let (driver, _events, helper_out, _helper_in) = driver();
        drop(helper_out);

        let err = driver.list_sensors().await.unwrap_err();
        assert!(matches!(err, DeviceError::ChannelClosed(_)));
    }
}
