//! Medication status engine.
//!
//! Converts compartment-open events into medication records by matching the
//! open time against the nearest scheduled dose, and sweeps for doses whose
//! time has passed without any record. Adherence metrics and alert checks
//! are computed from the records held by the storage collaborator.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::MedicationPolicyConfig;
use crate::error::{Error, Result};
use crate::medication::{
    compartment_to_medication, MedicationRecord, MedicationSchedule, MedicationStatus,
};
use crate::notify::{Alert, Notifier};
use crate::store::MedicationStore;

/// How a sensor-confirmed dose is classified by its deviation from the
/// nearest scheduled time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusPolicy {
    /// Deviation still reported as on time
    pub on_time: Duration,
    /// Deviation beyond which `late_status` applies
    pub late_after: Duration,
    /// Status for doses beyond `late_after`
    pub late_status: MedicationStatus,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            on_time: Duration::minutes(15),
            late_after: Duration::minutes(30),
            late_status: MedicationStatus::Taken,
        }
    }
}

impl From<&MedicationPolicyConfig> for StatusPolicy {
    fn from(config: &MedicationPolicyConfig) -> Self {
        Self {
            on_time: Duration::minutes(config.on_time_minutes),
            late_after: Duration::minutes(config.late_minutes),
            late_status: config.late_status,
        }
    }
}

impl StatusPolicy {
    /// Policy where a very late dose counts as missed even though the
    /// compartment was opened.
    pub fn strict() -> Self {
        Self {
            late_status: MedicationStatus::Missed,
            ..Self::default()
        }
    }

    /// Classify `opened - scheduled` into a status and a record note.
    pub fn classify(&self, deviation: Duration) -> (MedicationStatus, String) {
        let magnitude = if deviation < Duration::zero() {
            -deviation
        } else {
            deviation
        };
        let minutes = magnitude.num_minutes();
        let direction = if deviation < Duration::zero() {
            "Early"
        } else {
            "Late"
        };

        if magnitude <= self.on_time {
            (MedicationStatus::Taken, "On time".to_string())
        } else if magnitude <= self.late_after {
            (
                MedicationStatus::Taken,
                format!("{} by {} minutes", direction, minutes),
            )
        } else {
            (
                self.late_status,
                format!("Very {} by {} minutes", direction.to_lowercase(), minutes),
            )
        }
    }
}

/// Per-day dose counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_scheduled: usize,
    pub taken: usize,
    pub missed: usize,
    pub pending: usize,
}

/// Calendar status of a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    NoSchedule,
    AllTaken,
    Partial,
    Missed,
}

/// Dose counts over one calendar month, up to today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyStatistics {
    pub year: i32,
    pub month: u32,
    pub total_scheduled: usize,
    pub taken: usize,
    pub missed: usize,
    pub days_with_schedule: usize,
    /// Days where every scheduled dose was taken
    pub perfect_days: usize,
    pub adherence_rate: f64,
    pub perfect_days_rate: f64,
}

/// Medication status engine.
pub struct MedicationStatusEngine {
    store: Arc<dyn MedicationStore>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
    policy: StatusPolicy,
    missed_grace: Duration,
    low_adherence_percent: f64,
    adherence_window_days: u32,
    daily_summary_hour: u32,
    last_summary_date: Mutex<Option<NaiveDate>>,
}

impl MedicationStatusEngine {
    pub fn new(store: Arc<dyn MedicationStore>) -> Self {
        Self::from_config(store, &MedicationPolicyConfig::default())
    }

    pub fn from_config(store: Arc<dyn MedicationStore>, config: &MedicationPolicyConfig) -> Self {
        Self {
            store,
            notifier: None,
            clock: Arc::new(SystemClock),
            policy: StatusPolicy::from(config),
            missed_grace: Duration::seconds(config.missed_grace_secs),
            low_adherence_percent: config.low_adherence_percent,
            adherence_window_days: config.adherence_window_days,
            daily_summary_hour: config.daily_summary_hour,
            last_summary_date: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: StatusPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &StatusPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn MedicationStore> {
        &self.store
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Record a dose for a compartment-open event.
    ///
    /// Returns `Error::NoSchedule` when the compartment's medication has no
    /// schedule active on the day of `opened_at`; no record is created then.
    pub async fn on_compartment_opened(
        &self,
        compartment_id: &str,
        opened_at: NaiveDateTime,
    ) -> Result<MedicationRecord> {
        let medication_id = compartment_to_medication(compartment_id)?;
        let date = opened_at.date();

        let schedule = self
            .active_schedule_for(&medication_id, date)
            .await?
            .ok_or_else(|| {
                info!(
                    compartment = %compartment_id,
                    medication = %medication_id,
                    "No schedule for opened compartment"
                );
                Error::NoSchedule {
                    medication_id: medication_id.clone(),
                }
            })?;

        let scheduled_time = schedule
            .nearest_time(opened_at.time())
            .ok_or_else(|| Error::NoSchedule {
                medication_id: medication_id.clone(),
            })?;
        let deviation = opened_at - date.and_time(scheduled_time);
        let (status, notes) = self.policy.classify(deviation);

        let record = MedicationRecord {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            medication_id: medication_id.clone(),
            scheduled_date: date,
            scheduled_time,
            actual_time: Some(opened_at),
            status,
            sensor_confirmed: true,
            notes,
            created_at: self.clock.now(),
        };
        self.store.save_record(record.clone()).await?;

        info!(
            medication = %medication_id,
            scheduled = %scheduled_time.format("%H:%M"),
            actual = %opened_at.format("%H:%M"),
            status = %status,
            "Recorded sensor-confirmed dose"
        );
        Ok(record)
    }

    /// Create MISSED records for every dose slot already passed today by
    /// more than the grace period that has no record yet.
    ///
    /// Safe to call repeatedly: slots that already have a record of any
    /// status are skipped.
    pub async fn sweep_missed_doses(&self, now: NaiveDateTime) -> Result<Vec<MedicationRecord>> {
        let today = now.date();
        let mut created = Vec::new();

        for schedule in self.store.active_schedules().await? {
            if !schedule.is_active_on(today) {
                continue;
            }
            for &time in &schedule.schedule_times {
                if now - today.and_time(time) <= self.missed_grace {
                    continue;
                }
                if self.store.record_exists(&schedule.id, today, time).await? {
                    continue;
                }
                let record = MedicationRecord {
                    id: Uuid::new_v4().to_string(),
                    schedule_id: schedule.id.clone(),
                    medication_id: schedule.medication_id.clone(),
                    scheduled_date: today,
                    scheduled_time: time,
                    actual_time: None,
                    status: MedicationStatus::Missed,
                    sensor_confirmed: false,
                    notes: "Automatically marked as missed".to_string(),
                    created_at: now,
                };
                self.store.save_record(record.clone()).await?;
                warn!(
                    medication = %schedule.medication_id,
                    scheduled = %time.format("%H:%M"),
                    "Dose missed"
                );
                created.push(record);
            }
        }

        if !created.is_empty() {
            let medication_ids = self.missed_medications_on(today).await?;
            self.notify(Alert::MissedDoses {
                date: today,
                medication_ids,
            })
            .await;
        } else {
            debug!("Missed-dose sweep found nothing new");
        }

        Ok(created)
    }

    /// Sweep using the engine clock.
    pub async fn sweep_now(&self) -> Result<Vec<MedicationRecord>> {
        self.sweep_missed_doses(self.clock.now()).await
    }

    /// Percentage of TAKEN records among all records scheduled within the
    /// trailing `days`. Zero when the window is empty.
    pub async fn adherence_rate(&self, days: u32) -> Result<f64> {
        let now = self.clock.now();
        let records = self
            .store
            .records_between(now - Duration::days(days as i64), now)
            .await?;
        if records.is_empty() {
            return Ok(0.0);
        }
        let taken = records
            .iter()
            .filter(|r| r.status == MedicationStatus::Taken)
            .count();
        Ok(taken as f64 / records.len() as f64 * 100.0)
    }

    pub async fn today_summary(&self) -> Result<DailySummary> {
        self.summary_for(self.clock.now().date()).await
    }

    pub async fn summary_for(&self, date: NaiveDate) -> Result<DailySummary> {
        let total_scheduled: usize = self
            .schedules_active_on(date)
            .await?
            .iter()
            .map(|s| s.schedule_times.len())
            .sum();
        let records = self.records_on(date).await?;
        let taken = count_status(&records, MedicationStatus::Taken);
        let missed = count_status(&records, MedicationStatus::Missed);

        Ok(DailySummary {
            date,
            total_scheduled,
            taken,
            missed,
            pending: total_scheduled.saturating_sub(taken + missed),
        })
    }

    /// Send today's summary to the notifier once the summary hour has
    /// passed. At most one summary goes out per day; returns it when sent.
    pub async fn daily_summary_if_due(&self, now: NaiveDateTime) -> Result<Option<DailySummary>> {
        let today = now.date();
        let already_sent = *self.last_summary_date.lock() == Some(today);
        if already_sent || now.hour() < self.daily_summary_hour {
            return Ok(None);
        }

        let summary = self.summary_for(today).await?;
        *self.last_summary_date.lock() = Some(today);
        info!(
            date = %today,
            scheduled = summary.total_scheduled,
            taken = summary.taken,
            missed = summary.missed,
            "Sending daily summary"
        );
        self.notify(Alert::DailySummary(summary.clone())).await;
        Ok(Some(summary))
    }

    /// Totals for `year`-`month`, counting only days up to today.
    pub async fn monthly_statistics(&self, year: i32, month: u32) -> Result<MonthlyStatistics> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| Error::InvalidInput(format!("invalid month {}-{}", year, month)))?;
        let today = self.clock.now().date();

        let mut stats = MonthlyStatistics {
            year,
            month,
            total_scheduled: 0,
            taken: 0,
            missed: 0,
            days_with_schedule: 0,
            perfect_days: 0,
            adherence_rate: 0.0,
            perfect_days_rate: 0.0,
        };

        for date in first.iter_days().take_while(|d| d.month() == month && *d <= today) {
            let summary = self.summary_for(date).await?;
            if summary.total_scheduled == 0 {
                continue;
            }
            stats.days_with_schedule += 1;
            stats.total_scheduled += summary.total_scheduled;
            stats.taken += summary.taken;
            stats.missed += summary.missed;
            if summary.taken == summary.total_scheduled {
                stats.perfect_days += 1;
            }
        }

        if stats.total_scheduled > 0 {
            stats.adherence_rate = stats.taken as f64 / stats.total_scheduled as f64 * 100.0;
        }
        if stats.days_with_schedule > 0 {
            stats.perfect_days_rate =
                stats.perfect_days as f64 / stats.days_with_schedule as f64 * 100.0;
        }
        Ok(stats)
    }

    /// Calendar status for `date`.
    pub async fn daily_status(&self, date: NaiveDate) -> Result<DayStatus> {
        let summary = self.summary_for(date).await?;
        if summary.total_scheduled == 0 {
            return Ok(DayStatus::NoSchedule);
        }
        let status = if summary.taken == summary.total_scheduled {
            DayStatus::AllTaken
        } else if summary.taken > 0 {
            DayStatus::Partial
        } else if summary.missed > 0 || date < self.clock.now().date() {
            DayStatus::Missed
        } else {
            DayStatus::NoSchedule
        };
        Ok(status)
    }

    /// Medication ids with a MISSED record on `date`, sorted and deduplicated.
    pub async fn missed_medications_on(&self, date: NaiveDate) -> Result<Vec<String>> {
        let missed: BTreeSet<String> = self
            .records_on(date)
            .await?
            .into_iter()
            .filter(|r| r.status == MedicationStatus::Missed)
            .map(|r| r.medication_id)
            .collect();
        Ok(missed.into_iter().collect())
    }

    /// Evaluate emergency conditions and notify for each one found.
    ///
    /// - records exist for the last 24 hours but none is TAKEN
    /// - adherence over the configured window is below the threshold
    pub async fn check_emergency_conditions(&self) -> Result<Vec<Alert>> {
        let now = self.clock.now();
        let mut alerts = Vec::new();

        let last_day = self
            .store
            .records_between(now - Duration::hours(24), now)
            .await?;
        if !last_day.is_empty() && count_status(&last_day, MedicationStatus::Taken) == 0 {
            alerts.push(Alert::Emergency {
                reason: "No medications taken in the last 24 hours".to_string(),
            });
        }

        let window = self
            .store
            .records_between(now - Duration::days(self.adherence_window_days as i64), now)
            .await?;
        // An empty window is not an emergency, unlike a plain 0 % < threshold reading.
        if !window.is_empty() {
            let adherence = self.adherence_rate(self.adherence_window_days).await?;
            if adherence < self.low_adherence_percent {
                alerts.push(Alert::Emergency {
                    reason: format!(
                        "Low medication adherence: {:.1}% over the last {} days",
                        adherence, self.adherence_window_days
                    ),
                });
            }
        }

        for alert in &alerts {
            self.notify(alert.clone()).await;
        }
        Ok(alerts)
    }

    async fn notify(&self, alert: Alert) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&alert).await {
                warn!(subject = %alert.subject(), "Notifier failed: {}", e);
            }
        }
    }

    async fn active_schedule_for(
        &self,
        medication_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MedicationSchedule>> {
        Ok(self
            .schedules_active_on(date)
            .await?
            .into_iter()
            .find(|s| s.medication_id == medication_id))
    }

    async fn schedules_active_on(&self, date: NaiveDate) -> Result<Vec<MedicationSchedule>> {
        Ok(self
            .store
            .active_schedules()
            .await?
            .into_iter()
            .filter(|s| s.is_active_on(date))
            .collect())
    }

    async fn records_on(&self, date: NaiveDate) -> Result<Vec<MedicationRecord>> {
        let start = date.and_time(NaiveTime::default());
        let end = start + Duration::days(1) - Duration::seconds(1);
        self.store.records_between(start, end).await
    }
}

fn count_status(records: &[MedicationRecord], status: MedicationStatus) -> usize {
    records.iter().filter(|r| r.status == status).count()
}
