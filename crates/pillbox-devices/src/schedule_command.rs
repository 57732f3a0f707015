//! `SET_SCHEDULE` payload construction.

use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use pillbox_core::medication::{medication_name, MedicationSchedule};
use serde::{Deserialize, Serialize};

use crate::protocol::CommandResponse;

/// Longest notes string the pillbox display accepts, in characters.
pub const NOTES_MAX_CHARS: usize = 100;

/// How long the device gets to answer a `SET_SCHEDULE`.
pub const SCHEDULE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One medication as the pillbox expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationEntry {
    pub medication_id: String,
    pub medication_name: String,
    pub times_per_day: u32,
    pub dosage_count: u32,
    pub schedule_times: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub notes: String,
    pub is_active: bool,
}

impl From<&MedicationSchedule> for MedicationEntry {
    fn from(schedule: &MedicationSchedule) -> Self {
        Self {
            medication_id: schedule.medication_id.clone(),
            medication_name: medication_name(&schedule.medication_id),
            times_per_day: schedule.times_per_day,
            dosage_count: schedule.dosage_count,
            schedule_times: schedule
                .schedule_times
                .iter()
                .map(|t| t.format("%H:%M").to_string())
                .collect(),
            start_date: schedule.start_date,
            end_date: schedule.end_date,
            notes: schedule.notes.chars().take(NOTES_MAX_CHARS).collect(),
            is_active: schedule.is_active,
        }
    }
}

/// Full schedule set, replacing whatever the device had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCommand {
    pub timestamp: String,
    pub medications: Vec<MedicationEntry>,
}

impl ScheduleCommand {
    pub fn medication_ids(&self) -> impl Iterator<Item = &str> {
        self.medications.iter().map(|m| m.medication_id.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandBuildError {
    #[error("No active schedules to send")]
    NoActiveSchedules,
}

/// Builds `SET_SCHEDULE` payloads from stored schedules.
pub struct ScheduleCommandBuilder;

impl ScheduleCommandBuilder {
    /// Build with the host's current local time as the timestamp.
    pub fn build(schedules: &[MedicationSchedule]) -> Result<ScheduleCommand, CommandBuildError> {
        Self::build_at(schedules, Local::now().naive_local())
    }

    pub fn build_at(
        schedules: &[MedicationSchedule],
        now: NaiveDateTime,
    ) -> Result<ScheduleCommand, CommandBuildError> {
        let medications: Vec<MedicationEntry> = schedules
            .iter()
            .filter(|s| s.is_active)
            .map(MedicationEntry::from)
            .collect();

        if medications.is_empty() {
            return Err(CommandBuildError::NoActiveSchedules);
        }

        Ok(ScheduleCommand {
            timestamp: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            medications,
        })
    }

    /// Compartment chosen by the device for each medication, in response order.
    /// Entries with a negative box mean the device could not place the medication.
    pub fn assignments(response: &CommandResponse) -> Vec<(String, Option<u8>)> {
        response
            .assignments
            .iter()
            .map(|a| {
                (
                    a.medication_id.clone(),
                    u8::try_from(a.compartment_index).ok(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceCommand;
    use chrono::NaiveTime;
    use serde_json::json;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, d).unwrap()
    }

    fn schedule(id: &str) -> MedicationSchedule {
        MedicationSchedule::new(
            id,
            vec![
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(20, 30, 0).unwrap(),
            ],
            date(1),
            date(31),
        )
    }

    fn now() -> NaiveDateTime {
        date(15).and_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn test_build_empty_is_error() {
        assert_eq!(
            ScheduleCommandBuilder::build_at(&[], now()),
            Err(CommandBuildError::NoActiveSchedules)
        );
        assert_eq!(
            ScheduleCommandBuilder::build_at(&[schedule("M0").inactive()], now()),
            Err(CommandBuildError::NoActiveSchedules)
        );
    }

    #[test]
    fn test_build_filters_inactive() {
        let cmd = ScheduleCommandBuilder::build_at(
            &[schedule("M0"), schedule("M1").inactive(), schedule("M2")],
            now(),
        )
        .unwrap();
        assert_eq!(cmd.medication_ids().collect::<Vec<_>>(), vec!["M0", "M2"]);
        assert_eq!(cmd.timestamp, "2024-10-15T09:00:00");
    }

    #[test]
    fn test_entry_shape() {
        let cmd =
            ScheduleCommandBuilder::build_at(&[schedule("M3").with_dosage(2)], now()).unwrap();
        let entry = &cmd.medications[0];
        assert_eq!(entry.medication_name, medication_name("M3"));
        assert_eq!(entry.schedule_times, vec!["08:00", "20:30"]);
        assert_eq!(entry.times_per_day, 2);
        assert_eq!(entry.dosage_count, 2);
    }

    #[test]
    fn test_notes_truncated_by_characters() {
        let notes: String = "é".repeat(150);
        let cmd =
            ScheduleCommandBuilder::build_at(&[schedule("M0").with_notes(notes)], now()).unwrap();
        assert_eq!(cmd.medications[0].notes.chars().count(), NOTES_MAX_CHARS);
    }

    #[test]
    fn test_wire_format() {
        let cmd = ScheduleCommandBuilder::build_at(&[schedule("M0")], now()).unwrap();
        let value = serde_json::to_value(DeviceCommand::SetSchedule(cmd)).unwrap();
        assert_eq!(value["cmd"], json!("SET_SCHEDULE"));
        assert_eq!(value["timestamp"], json!("2024-10-15T09:00:00"));
        assert_eq!(value["medications"][0]["start_date"], json!("2024-10-01"));
        assert_eq!(value["medications"][0]["is_active"], json!(true));
    }

    #[test]
    fn test_assignments() {
        let response = CommandResponse::from_value(json!({
            "status": "OK",
            "assignments": [
                {"medication_id": "M0", "box": 4},
                {"medication_id": "M1", "box": -1}
            ]
        }));
        assert_eq!(
            ScheduleCommandBuilder::assignments(&response),
            vec![("M0".to_string(), Some(4)), ("M1".to_string(), None)]
        );
    }
}
