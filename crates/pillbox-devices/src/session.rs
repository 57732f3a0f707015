//! TCP session with the pillbox.
//!
//! One background task owns the read half of the socket. It frames the
//! byte stream into lines, updates the cached device state, and routes
//! typed messages to the consumer. Commands are correlated by arrival
//! order: while a command is in flight, the next untyped line is its reply.
//! Only one command may be in flight per session.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use parking_lot::RwLock;
use pillbox_core::config::SessionConfig;
use pillbox_core::medication::medication_name;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::framing::LineFramer;
use crate::protocol::{
    decode_line, CommandResponse, CompartmentStatus, DeviceCommand, DeviceMessage, Frame,
    OutboundMessage, StatusReport, WelcomeInfo,
};
use crate::router::MessageRouter;
use crate::schedule_command::{ScheduleCommand, SCHEDULE_RESPONSE_TIMEOUT};

const READ_CHUNK: usize = 4096;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to pillbox")]
    NotConnected,

    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Pillbox unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Session broken: {0}")]
    SessionBroken(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// State shared between the session handle and its receive loop.
struct Shared {
    state: RwLock<ConnectionState>,
    welcome: RwLock<Option<WelcomeInfo>>,
    last_status: RwLock<Option<StatusReport>>,
    compartments: RwLock<HashMap<String, CompartmentStatus>>,
    pending: parking_lot::Mutex<Option<oneshot::Sender<CommandResponse>>>,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            welcome: RwLock::new(None),
            last_status: RwLock::new(None),
            compartments: RwLock::new(HashMap::new()),
            pending: parking_lot::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            let previous = *current;
            debug!(from = ?previous, to = ?state, "Session state change");
            *current = state;
        }
    }

    fn handle_line(&self, line: &str, router: &MessageRouter) {
        match decode_line(line) {
            Frame::Message(message) => {
                self.cache(&message);
                if !router.route(message) {
                    debug!("Consumer gone, dropping message");
                }
            }
            Frame::Untyped(value) => match self.pending.lock().take() {
                Some(reply) => {
                    let _ = reply.send(CommandResponse::from_value(value));
                }
                None => debug!("Discarding untyped line: {}", line),
            },
            Frame::Malformed(error) => match self.pending.lock().take() {
                Some(reply) => {
                    let _ = reply.send(CommandResponse::error(format!(
                        "Invalid response: {}",
                        error
                    )));
                }
                None => warn!("Dropping malformed line: {}", error),
            },
            Frame::UnknownType(kind) => debug!(kind = %kind, "Ignoring unknown message type"),
            Frame::Invalid { kind, error } => {
                warn!(kind = kind.as_str(), "Dropping invalid message: {}", error)
            }
        }
    }

    fn cache(&self, message: &DeviceMessage) {
        match message {
            DeviceMessage::Welcome(welcome) => {
                info!(
                    device = %welcome.device_name,
                    boxes = welcome.compartment_count,
                    time = %welcome.device_time,
                    "Pillbox says hello"
                );
                *self.welcome.write() = Some(welcome.clone());
            }
            DeviceMessage::Status(status) => {
                *self.last_status.write() = Some(status.clone());
            }
            DeviceMessage::CompartmentStatus(status) => {
                self.compartments
                    .write()
                    .insert(status.compartment_id.clone(), status.clone());
            }
            DeviceMessage::BoxEvent(event) => {
                debug!(compartment = event.compartment_index, state = ?event.state, "Box event");
            }
        }
    }
}

/// A connection to one pillbox.
pub struct DeviceSession {
    config: SessionConfig,
    router: MessageRouter,
    shared: Arc<Shared>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    command_lock: Mutex<()>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    peer: RwLock<Option<SocketAddr>>,
}

impl DeviceSession {
    /// Create a disconnected session delivering messages to `router`.
    pub fn new(config: &SessionConfig, router: MessageRouter) -> Self {
        Self {
            config: config.clone(),
            router,
            shared: Arc::new(Shared::new()),
            writer: Mutex::new(None),
            command_lock: Mutex::new(()),
            task: parking_lot::Mutex::new(None),
            peer: RwLock::new(None),
        }
    }

    /// Open the connection and start the receive loop.
    ///
    /// Returns once the socket is up; the welcome message arrives later
    /// through the router. An existing connection is closed first.
    pub async fn connect(&self, address: &str, port: u16) -> Result<(), SessionError> {
        self.disconnect().await;

        let target = format!("{}:{}", address, port);
        self.shared.set_state(ConnectionState::Connecting);
        info!(addr = %target, "Connecting to pillbox");

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!(addr = %target, "Connection failed: {}", e);
                return Err(match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        SessionError::ConnectionRefused(target)
                    }
                    _ => SessionError::Unreachable {
                        addr: target,
                        reason: e.to_string(),
                    },
                });
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!(addr = %target, "Connection timed out");
                return Err(SessionError::Timeout(target));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }
        *self.peer.write() = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connected);

        let handle = tokio::spawn(receive_loop(
            reader,
            self.shared.clone(),
            self.router.clone(),
            self.config.poll_interval(),
            self.config.max_line_bytes,
        ));
        *self.task.lock() = Some(handle);

        info!(addr = %target, "Connected to pillbox");
        Ok(())
    }

    /// Stop the receive loop, wait for it to exit and close the socket.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Receive loop ended abnormally: {}", e);
            }
            info!("Disconnected from pillbox");
        }

        self.shared.pending.lock().take();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Send a command and wait up to `timeout` for its single reply.
    ///
    /// Never fails: transport problems come back as `ERROR`, silence as
    /// `TIMEOUT`.
    pub async fn send_command<T: Serialize>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> CommandResponse {
        let _in_flight = self.command_lock.lock().await;

        // The slot goes in before the liveness check: a receive loop that
        // stops after this point drops the sender on its way out.
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(reply_tx);

        if !self.shared.running.load(Ordering::SeqCst) {
            self.shared.pending.lock().take();
            return CommandResponse::error(SessionError::NotConnected.to_string());
        }

        if let Err(e) = self.write_json(payload).await {
            self.shared.pending.lock().take();
            return CommandResponse::error(e.to_string());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => {
                debug!(status = ?response.status, "Command answered");
                response
            }
            Ok(Err(_)) => CommandResponse::error("Connection lost while waiting for response"),
            Err(_) => {
                self.shared.pending.lock().take();
                warn!(timeout_ms = timeout.as_millis() as u64, "Command timed out");
                CommandResponse::timeout()
            }
        }
    }

    /// Write one message without waiting for anything back.
    ///
    /// A failed write marks the session disconnected. Fails with
    /// `NotConnected` once the receive loop has stopped.
    pub async fn send_fire_and_forget<T: Serialize>(
        &self,
        payload: &T,
    ) -> Result<(), SessionError> {
        self.write_json(payload).await
    }

    async fn write_json<T: Serialize>(&self, payload: &T) -> Result<(), SessionError> {
        let mut bytes = serde_json::to_vec(payload)?;
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        if !self.shared.running.load(Ordering::SeqCst) {
            // Loop saw the peer go away; release the half-closed socket.
            writer.take();
            return Err(SessionError::NotConnected);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let result = match stream.write_all(&bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Write failed, session is down: {}", e);
            writer.take();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(SessionError::SessionBroken(e.to_string()));
        }
        Ok(())
    }

    /// Tell the device which medication lives in which compartment.
    pub async fn send_medication_config(
        &self,
        compartments: BTreeMap<String, String>,
    ) -> Result<(), SessionError> {
        self.send_fire_and_forget(&OutboundMessage::MedicationConfig {
            compartments,
            timestamp: now_iso(),
        })
        .await
    }

    /// Show a dose reminder on the pillbox screen for `duration` seconds.
    pub async fn send_display_message(
        &self,
        medication_id: &str,
        dosage_count: u32,
        scheduled_time: &str,
        notes: &str,
        duration: u32,
    ) -> Result<(), SessionError> {
        let message = reminder_text(medication_id, dosage_count, scheduled_time, notes);
        self.send_fire_and_forget(&OutboundMessage::DisplayMessage {
            medication_id: medication_id.to_string(),
            message,
            notes: notes.to_string(),
            duration,
            timestamp: now_iso(),
        })
        .await
    }

    /// Ask for a fresh `status` push.
    pub async fn request_status(&self) -> Result<(), SessionError> {
        self.send_fire_and_forget(&OutboundMessage::StatusRequest {
            timestamp: now_iso(),
        })
        .await
    }

    pub async fn send_simple_message(&self, text: &str) -> Result<(), SessionError> {
        self.send_fire_and_forget(&OutboundMessage::SimpleMessage {
            message: text.to_string(),
            timestamp: now_iso(),
        })
        .await
    }

    /// Set the device clock.
    pub async fn set_time(&self, datetime: NaiveDateTime) -> CommandResponse {
        let command = DeviceCommand::SetTime {
            datetime: datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        self.send_command(&command, self.config.command_timeout()).await
    }

    /// Replace the device's schedule set.
    pub async fn send_schedule(&self, command: &ScheduleCommand) -> CommandResponse {
        info!(medications = command.medications.len(), "Sending schedule");
        let command = DeviceCommand::SetSchedule(command.clone());
        self.send_command(&command, SCHEDULE_RESPONSE_TIMEOUT).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    /// Most recent welcome, if one arrived on this or an earlier connection.
    pub fn welcome(&self) -> Option<WelcomeInfo> {
        self.shared.welcome.read().clone()
    }

    pub fn last_status(&self) -> Option<StatusReport> {
        self.shared.last_status.read().clone()
    }

    pub fn compartment(&self, compartment_id: &str) -> Option<CompartmentStatus> {
        self.shared.compartments.read().get(compartment_id).cloned()
    }

    pub fn compartments(&self) -> Vec<CompartmentStatus> {
        let mut all: Vec<_> = self.shared.compartments.read().values().cloned().collect();
        all.sort_by(|a, b| a.compartment_id.cmp(&b.compartment_id));
        all
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    router: MessageRouter,
    poll_interval: Duration,
    max_line_bytes: usize,
) {
    let mut framer = LineFramer::new(max_line_bytes);
    let mut buf = vec![0u8; READ_CHUNK];

    while shared.running.load(Ordering::SeqCst) {
        match tokio::time::timeout(poll_interval, reader.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("Pillbox closed the connection");
                break;
            }
            Ok(Ok(n)) => {
                for line in framer.push(&buf[..n]) {
                    shared.handle_line(&line, &router);
                }
            }
            Ok(Err(e)) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.pending.lock().take();
    shared.set_state(ConnectionState::Disconnected);
    debug!("Receive loop stopped");
}

fn now_iso() -> String {
    Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn reminder_text(
    medication_id: &str,
    dosage_count: u32,
    scheduled_time: &str,
    notes: &str,
) -> String {
    let mut text = format!(
        "Medication Reminder\n\nMedication: {} ({})\nTime: {}\nDosage: {} pills\n",
        medication_id,
        medication_name(medication_id),
        scheduled_time,
        dosage_count
    );
    if !notes.is_empty() {
        text.push_str(&format!("\nInstructions:\n{}\n", notes));
    }
    text.push_str("\nPlease take medication on time!");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandStatus;
    use crate::router::channel;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_reminder_text() {
        let text = reminder_text("M0", 2, "08:00", "With food");
        assert!(text.starts_with("Medication Reminder"));
        assert!(text.contains("Dosage: 2 pills"));
        assert!(text.contains("Instructions:\nWith food"));

        assert!(!reminder_text("M0", 1, "08:00", "").contains("Instructions"));
    }

    #[test]
    fn test_untyped_line_answers_pending_command() {
        let (router, _rx) = channel();
        let shared = Shared::new();
        let (tx, mut rx) = oneshot::channel();
        *shared.pending.lock() = Some(tx);

        shared.handle_line(r#"{"status":"OK"}"#, &router);
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(shared.pending.lock().is_none());
    }

    #[test]
    fn test_malformed_line_answers_pending_with_error() {
        let (router, _rx) = channel();
        let shared = Shared::new();
        let (tx, mut rx) = oneshot::channel();
        *shared.pending.lock() = Some(tx);

        shared.handle_line("{oops", &router);
        let response = rx.try_recv().unwrap();
        assert_eq!(response.status, CommandStatus::Error);
    }

    #[test]
    fn test_typed_line_is_routed_and_cached() {
        let (router, mut rx) = channel();
        let shared = Shared::new();

        shared.handle_line(
            r#"{"type":"compartment_status","compartment_id":"2","is_open":true}"#,
            &router,
        );
        shared.handle_line(r#"{"type":"welcome","device":"ESP32-Pillbox","boxes":10}"#, &router);
        shared.handle_line(r#"{"type":"mystery"}"#, &router);
        shared.handle_line("garbage", &router);

        assert_eq!(rx.drain().len(), 2);
        assert!(shared.compartments.read().get("2").unwrap().is_open);
        assert_eq!(shared.welcome.read().as_ref().unwrap().compartment_count, 10);
    }

    #[tokio::test]
    async fn test_command_after_loop_stopped_is_error_not_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (router, _rx) = channel();
        let config = SessionConfig {
            poll_interval_ms: 50,
            ..Default::default()
        };
        let session = DeviceSession::new(&config, router);
        session.connect("127.0.0.1", port).await.unwrap();
        let (_device, _) = listener.accept().await.unwrap();

        // Receive loop gone but the state not yet flipped to Disconnected.
        let handle = session.task.lock().take().unwrap();
        handle.abort();
        let _ = handle.await;
        session.shared.running.store(false, Ordering::SeqCst);
        assert!(session.is_connected());

        let started = std::time::Instant::now();
        let response = session
            .send_command(&json!({"cmd": "PING"}), Duration::from_secs(2))
            .await;
        assert_eq!(response.status, CommandStatus::Error);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(session.shared.pending.lock().is_none());

        assert!(matches!(
            session.send_simple_message("hello").await,
            Err(SessionError::NotConnected)
        ));
    }
}
