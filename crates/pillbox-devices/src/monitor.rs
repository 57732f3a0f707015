//! Feeds routed box events into the medication status engine.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use pillbox_core::engine::MedicationStatusEngine;
use pillbox_core::medication::MedicationRecord;
use pillbox_core::Error;
use tracing::{debug, info, warn};

use crate::protocol::{BoxState, DeviceMessage};
use crate::router::{Envelope, MessageReceiver};

/// What the monitor did with one routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Compartment opened and a record was stored.
    DoseRecorded(MedicationRecord),
    /// Compartment opened but its medication has no active schedule.
    Unscheduled { compartment: String },
    /// Compartment opened but the engine failed.
    RecordFailed { compartment: String, error: String },
    BoxClosed { compartment: u8 },
    /// Any other message, passed through untouched.
    Device(DeviceMessage),
}

pub struct PillboxMonitor {
    receiver: MessageReceiver,
    engine: Arc<MedicationStatusEngine>,
}

impl PillboxMonitor {
    pub fn new(receiver: MessageReceiver, engine: Arc<MedicationStatusEngine>) -> Self {
        Self { receiver, engine }
    }

    pub fn engine(&self) -> &Arc<MedicationStatusEngine> {
        &self.engine
    }

    /// Handle everything queued right now, oldest first.
    pub async fn process_pending(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        for envelope in self.receiver.drain() {
            events.push(self.handle(envelope).await);
        }
        events
    }

    /// Handle messages as they arrive until the session side goes away.
    pub async fn run<F>(mut self, mut handler: F)
    where
        F: FnMut(MonitorEvent) + Send,
    {
        while let Some(envelope) = self.receiver.recv().await {
            let event = self.handle(envelope).await;
            handler(event);
        }
        debug!("Router closed, monitor exiting");
    }

    async fn handle(&self, envelope: Envelope) -> MonitorEvent {
        let event = match envelope.message {
            DeviceMessage::BoxEvent(event) => event,
            other => return MonitorEvent::Device(other),
        };

        if event.state == BoxState::Closed {
            return MonitorEvent::BoxClosed {
                compartment: event.compartment_index,
            };
        }

        let compartment = event.compartment_index.to_string();
        let now = self.engine.now();
        let opened_at = parse_device_time(&event.timestamp, now.date()).unwrap_or(now);
        info!(
            compartment = %compartment,
            at = %opened_at,
            seq = envelope.seq,
            "Compartment opened"
        );

        match self
            .engine
            .on_compartment_opened(&compartment, opened_at)
            .await
        {
            Ok(record) => MonitorEvent::DoseRecorded(record),
            Err(Error::NoSchedule { .. }) => MonitorEvent::Unscheduled { compartment },
            Err(e) => {
                warn!(compartment = %compartment, "Failed to record dose: {}", e);
                MonitorEvent::RecordFailed {
                    compartment,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Interpret a device timestamp. Time-only values are placed on `today`.
pub fn parse_device_time(raw: &str, today: NaiveDate) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(at);
    }
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
        .map(|time| today.and_time(time))
}
