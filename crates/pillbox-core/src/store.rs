//! Storage collaborator interface.
//!
//! Schedules and records live behind `MedicationStore`; the engine never
//! holds them between calls. `MemoryStore` is the in-process implementation
//! used by the CLI and the tests.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::medication::{MedicationRecord, MedicationSchedule};

/// Persistence for schedules and records.
#[async_trait]
pub trait MedicationStore: Send + Sync {
    /// Insert or replace a schedule by id.
    async fn save_schedule(&self, schedule: MedicationSchedule) -> Result<()>;

    async fn schedules(&self) -> Result<Vec<MedicationSchedule>>;

    /// Remove a schedule and every record referencing it.
    async fn delete_schedule(&self, schedule_id: &str) -> Result<()>;

    /// Insert or replace a record by id.
    async fn save_record(&self, record: MedicationRecord) -> Result<()>;

    /// Whether any record already covers the (schedule, date, time) slot.
    async fn record_exists(
        &self,
        schedule_id: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<bool>;

    /// Records whose scheduled timestamp falls in `[from, to]`.
    async fn records_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<MedicationRecord>>;

    /// Most recent records first, by creation time.
    async fn recent_records(&self, limit: usize) -> Result<Vec<MedicationRecord>>;

    /// Schedules flagged active, regardless of date range.
    async fn active_schedules(&self) -> Result<Vec<MedicationSchedule>> {
        Ok(self
            .schedules()
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    schedules: RwLock<Vec<MedicationSchedule>>,
    records: RwLock<Vec<MedicationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-loaded with schedules.
    pub fn with_schedules(schedules: Vec<MedicationSchedule>) -> Self {
        Self {
            schedules: RwLock::new(schedules),
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl MedicationStore for MemoryStore {
    async fn save_schedule(&self, schedule: MedicationSchedule) -> Result<()> {
        if schedule.medication_id.is_empty() {
            return Err(Error::InvalidInput("schedule without medication id".into()));
        }
        let mut schedules = self.schedules.write();
        match schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => schedules.push(schedule),
        }
        Ok(())
    }

    async fn schedules(&self) -> Result<Vec<MedicationSchedule>> {
        Ok(self.schedules.read().clone())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<()> {
        self.schedules.write().retain(|s| s.id != schedule_id);
        self.records.write().retain(|r| r.schedule_id != schedule_id);
        Ok(())
    }

    async fn save_record(&self, record: MedicationRecord) -> Result<()> {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn record_exists(
        &self,
        schedule_id: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<bool> {
        Ok(self
            .records
            .read()
            .iter()
            .any(|r| r.covers(schedule_id, date, time)))
    }

    async fn records_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<MedicationRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| {
                let at = r.scheduled_at();
                from <= at && at <= to
            })
            .cloned()
            .collect())
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<MedicationRecord>> {
        let mut records = self.records.read().clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}
