//! Medication data model.
//!
//! The host serves a single patient with a fixed set of ten medications,
//! M0..M9, each bound to the compartment with the same index.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Number of physical compartments in the pillbox.
pub const COMPARTMENT_COUNT: u8 = 10;

/// Fixed medication table.
pub const MEDICATIONS: [(&str, &str); 10] = [
    ("M0", "Medication M0"),
    ("M1", "Medication M1"),
    ("M2", "Medication M2"),
    ("M3", "Medication M3"),
    ("M4", "Medication M4"),
    ("M5", "Medication M5"),
    ("M6", "Medication M6"),
    ("M7", "Medication M7"),
    ("M8", "Medication M8"),
    ("M9", "Medication M9"),
];

/// Display name for a medication id.
pub fn medication_name(medication_id: &str) -> String {
    MEDICATIONS
        .iter()
        .find(|(id, _)| *id == medication_id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Unknown Medication {}", medication_id))
}

/// Resolve a compartment id ("0".."9") to its medication id ("M0".."M9").
pub fn compartment_to_medication(compartment_id: &str) -> Result<String> {
    let index: u8 = compartment_id
        .trim()
        .parse()
        .map_err(|_| Error::InvalidCompartment(compartment_id.to_string()))?;
    if index >= COMPARTMENT_COUNT {
        return Err(Error::InvalidCompartment(compartment_id.to_string()));
    }
    Ok(format!("M{}", index))
}

/// Medication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicationStatus {
    Pending,
    Taken,
    Missed,
    Skipped,
}

impl MedicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Taken => "taken",
            Self::Missed => "missed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for MedicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MedicationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "taken" => Ok(Self::Taken),
            "missed" => Ok(Self::Missed),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::InvalidInput(format!(
                "unknown medication status '{}'",
                other
            ))),
        }
    }
}

/// Time-of-day list plus validity range for one medication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationSchedule {
    pub id: String,
    /// M0-M9
    pub medication_id: String,
    pub times_per_day: u32,
    /// Pills per dose
    pub dosage_count: u32,
    /// Dose times, "HH:MM" on the wire
    #[serde(with = "hhmm_list")]
    pub schedule_times: Vec<NaiveTime>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Instructions shown on the pillbox screen
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl MedicationSchedule {
    pub fn new(
        medication_id: impl Into<String>,
        schedule_times: Vec<NaiveTime>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            medication_id: medication_id.into(),
            times_per_day: schedule_times.len() as u32,
            dosage_count: 1,
            schedule_times,
            start_date,
            end_date,
            notes: String::new(),
            is_active: true,
        }
    }

    pub fn with_dosage(mut self, dosage_count: u32) -> Self {
        self.dosage_count = dosage_count;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Active flag set and `date` inside the validity range.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.is_active && self.start_date <= date && date <= self.end_date
    }

    /// Scheduled time closest to `at`, ties going to the earlier entry in the list.
    pub fn nearest_time(&self, at: NaiveTime) -> Option<NaiveTime> {
        let mut best: Option<(NaiveTime, i64)> = None;
        for &time in &self.schedule_times {
            let diff = (at - time).num_seconds().abs();
            match best {
                Some((_, best_diff)) if best_diff <= diff => {}
                _ => best = Some((time, diff)),
            }
        }
        best.map(|(time, _)| time)
    }
}

/// One dose outcome. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationRecord {
    pub id: String,
    pub schedule_id: String,
    pub medication_id: String,
    pub scheduled_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub scheduled_time: NaiveTime,
    pub actual_time: Option<NaiveDateTime>,
    pub status: MedicationStatus,
    pub sensor_confirmed: bool,
    #[serde(default)]
    pub notes: String,
    pub created_at: NaiveDateTime,
}

impl MedicationRecord {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.scheduled_date.and_time(self.scheduled_time)
    }

    /// True when this record covers the given dose slot.
    pub fn covers(&self, schedule_id: &str, date: NaiveDate, time: NaiveTime) -> bool {
        self.schedule_id == schedule_id
            && self.scheduled_date == date
            && same_minute(self.scheduled_time, time)
    }
}

fn same_minute(a: NaiveTime, b: NaiveTime) -> bool {
    a.hour() == b.hour() && a.minute() == b.minute()
}

/// Parse "HH:MM" or "HH:MM:SS".
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| Error::InvalidInput(format!("invalid time of day '{}'", s)))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

mod hhmm_list {
    use chrono::NaiveTime;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(times: &[NaiveTime], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(times.len()))?;
        for time in times {
            seq.serialize_element(&time.format("%H:%M").to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NaiveTime>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| super::parse_time_of_day(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
