//! Alerts and the notifier collaborator.
//!
//! The engine computes alerts; delivery is the notifier's business.
//! `ContactLogNotifier` routes each alert to the family contacts whose
//! notification level asks for it and emits one log line per delivery.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::DailySummary;
use crate::error::Result;

/// Alert computed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// Doses recorded as missed today.
    MissedDoses {
        date: NaiveDate,
        medication_ids: Vec<String>,
    },
    /// Condition that needs attention right away.
    Emergency { reason: String },
    /// End-of-day roll-up.
    DailySummary(DailySummary),
}

impl Alert {
    pub fn subject(&self) -> String {
        match self {
            Alert::MissedDoses { medication_ids, .. } => format!(
                "Medication Alert - {} medications missed",
                medication_ids.len()
            ),
            Alert::Emergency { .. } => "URGENT: Medication Emergency Alert".to_string(),
            Alert::DailySummary(summary) => {
                format!("Daily medication summary for {}", summary.date)
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Alert::MissedDoses { medication_ids, .. } => {
                format!("Missed medications: {}", medication_ids.join(", "))
            }
            Alert::Emergency { reason } => format!("Emergency: {}", reason),
            Alert::DailySummary(s) => format!(
                "{}/{} taken, {} missed, {} pending",
                s.taken, s.total_scheduled, s.missed, s.pending
            ),
        }
    }
}

/// Which alerts a contact receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    All,
    MissedOnly,
    Emergency,
}

/// Family member who receives alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyContact {
    pub name: String,
    pub email: String,
    /// "Son", "Daughter", "Spouse", ...
    #[serde(default)]
    pub relationship: String,
    pub notification_level: NotificationLevel,
}

impl FamilyContact {
    pub fn wants(&self, alert: &Alert) -> bool {
        match (self.notification_level, alert) {
            (NotificationLevel::All, _) => true,
            (NotificationLevel::MissedOnly, Alert::MissedDoses { .. }) => true,
            (_, Alert::Emergency { .. }) => true,
            _ => false,
        }
    }
}

/// Alert delivery collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Notifier that logs one delivery per interested contact.
#[derive(Debug, Clone, Default)]
pub struct ContactLogNotifier {
    contacts: Vec<FamilyContact>,
}

impl ContactLogNotifier {
    pub fn new(contacts: Vec<FamilyContact>) -> Self {
        Self { contacts }
    }

    pub fn recipients<'a>(&'a self, alert: &'a Alert) -> impl Iterator<Item = &'a FamilyContact> {
        self.contacts.iter().filter(move |c| c.wants(alert))
    }
}

#[async_trait]
impl Notifier for ContactLogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        if self.contacts.is_empty() {
            warn!(subject = %alert.subject(), "No family contacts configured, alert dropped");
            return Ok(());
        }
        for contact in self.recipients(alert) {
            info!(
                to = %contact.email,
                name = %contact.name,
                subject = %alert.subject(),
                "{}",
                alert.body()
            );
        }
        Ok(())
    }
}
