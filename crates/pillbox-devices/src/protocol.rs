//! Wire protocol types.
//!
//! Inbound traffic is newline-delimited JSON, one object per line, tagged
//! by a `type` field. Outbound traffic is either a typed fire-and-forget
//! message or a `cmd`-keyed command answered by exactly one untyped
//! response object.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::schedule_command::ScheduleCommand;

/// Sent once by the device right after the connection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeInfo {
    #[serde(rename = "device", default)]
    pub device_name: String,
    #[serde(rename = "ip", default)]
    pub address: String,
    #[serde(rename = "boxes", default)]
    pub compartment_count: u32,
    #[serde(rename = "time", default)]
    pub device_time: String,
}

/// Periodic device status push. Most recent wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "time", default)]
    pub timestamp: String,
    #[serde(rename = "wifi", default)]
    pub network_info: Option<Value>,
    #[serde(rename = "scheduleCount", default)]
    pub schedule_count: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Physical lid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxState {
    #[serde(alias = "OPEN", alias = "opened")]
    Open,
    #[serde(alias = "CLOSED")]
    Closed,
}

/// One compartment open/close event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxEvent {
    #[serde(rename = "box")]
    pub compartment_index: u8,
    pub state: BoxState,
    #[serde(rename = "time", default)]
    pub timestamp: String,
}

/// Per-compartment status snapshot. Last write wins per compartment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentStatus {
    #[serde(deserialize_with = "string_or_number")]
    pub compartment_id: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(rename = "last_opened", default)]
    pub last_opened_at: String,
    #[serde(default)]
    pub medication_count: u32,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {}",
            other
        ))),
    }
}

/// Inbound message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Welcome,
    Status,
    BoxEvent,
    CompartmentStatus,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Status => "status",
            Self::BoxEvent => "box_event",
            Self::CompartmentStatus => "compartment_status",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "welcome" => Some(Self::Welcome),
            "status" => Some(Self::Status),
            "box_event" => Some(Self::BoxEvent),
            "compartment_status" => Some(Self::CompartmentStatus),
            _ => None,
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Welcome(WelcomeInfo),
    Status(StatusReport),
    BoxEvent(BoxEvent),
    CompartmentStatus(CompartmentStatus),
}

impl DeviceMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Welcome(_) => MessageKind::Welcome,
            Self::Status(_) => MessageKind::Status,
            Self::BoxEvent(_) => MessageKind::BoxEvent,
            Self::CompartmentStatus(_) => MessageKind::CompartmentStatus,
        }
    }
}

/// Classification of one framed line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Known `type` with a valid payload.
    Message(DeviceMessage),
    /// Valid JSON without a string `type`; command responses look like this.
    Untyped(Value),
    /// `type` present but not one we handle.
    UnknownType(String),
    /// Known `type` whose payload does not fit.
    Invalid { kind: MessageKind, error: String },
    /// Not JSON at all.
    Malformed(String),
}

/// Classify one line off the wire. Never fails; bad input is a variant.
pub fn decode_line(line: &str) -> Frame {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Frame::Malformed(e.to_string()),
    };

    let type_name = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Frame::Untyped(value),
    };

    let Some(kind) = MessageKind::from_type(&type_name) else {
        return Frame::UnknownType(type_name);
    };

    let decoded = match kind {
        MessageKind::Welcome => serde_json::from_value(value).map(DeviceMessage::Welcome),
        MessageKind::Status => serde_json::from_value(value).map(DeviceMessage::Status),
        MessageKind::BoxEvent => serde_json::from_value(value).map(DeviceMessage::BoxEvent),
        MessageKind::CompartmentStatus => {
            serde_json::from_value(value).map(DeviceMessage::CompartmentStatus)
        }
    };

    match decoded {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Invalid {
            kind,
            error: e.to_string(),
        },
    }
}

/// Typed fire-and-forget messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Compartment index to medication id mapping.
    MedicationConfig {
        compartments: BTreeMap<String, String>,
        timestamp: String,
    },
    /// Reminder shown on the pillbox screen.
    DisplayMessage {
        medication_id: String,
        message: String,
        notes: String,
        duration: u32,
        timestamp: String,
    },
    StatusRequest {
        timestamp: String,
    },
    SimpleMessage {
        message: String,
        timestamp: String,
    },
}

/// Commands that expect exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd")]
pub enum DeviceCommand {
    #[serde(rename = "SET_SCHEDULE")]
    SetSchedule(ScheduleCommand),
    #[serde(rename = "SET_TIME")]
    SetTime { datetime: String },
}

/// Outcome of a correlated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    /// Applied by the device.
    Ok,
    /// Rejected, or the reply could not be understood.
    Error,
    /// No reply in time; the command may or may not have been applied.
    Timeout,
}

/// Device-chosen compartment for a medication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompartmentAssignment {
    pub medication_id: String,
    #[serde(rename = "box")]
    pub compartment_index: i32,
}

/// Reply to a `DeviceCommand`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub assignments: Vec<CompartmentAssignment>,
}

impl CommandResponse {
    pub fn timeout() -> Self {
        Self {
            status: CommandStatus::Timeout,
            message: Some("No response from pillbox".to_string()),
            assignments: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Error,
            message: Some(message.into()),
            assignments: Vec::new(),
        }
    }

    /// Interpret an untyped reply object.
    pub fn from_value(value: Value) -> Self {
        let raw = value.to_string();
        serde_json::from_value(value)
            .unwrap_or_else(|e| Self::error(format!("Unexpected response {}: {}", raw, e)))
    }

    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}
