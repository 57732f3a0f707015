//! Core types for the pillbox host.
//!
//! This crate owns everything that does not touch the network:
//! - **Medication model**: schedules, records, statuses and the fixed M0..M9 table
//! - **Configuration**: one `PillboxConfig` value built at startup
//! - **Collaborators**: `MedicationStore` (persistence) and `Notifier` (alerts)
//! - **MedicationStatusEngine**: turns compartment-open events and sweep ticks
//!   into medication records and adherence metrics

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod medication;
pub mod notify;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    DiscoveryConfig, MedicationPolicyConfig, PillboxConfig, SessionConfig, DEFAULT_PILLBOX_PORT,
};
pub use engine::{
    DailySummary, DayStatus, MedicationStatusEngine, MonthlyStatistics, StatusPolicy,
};
pub use error::{Error, Result};
pub use medication::{
    compartment_to_medication, medication_name, MedicationRecord, MedicationSchedule,
    MedicationStatus, MEDICATIONS,
};
pub use notify::{Alert, ContactLogNotifier, FamilyContact, NotificationLevel, Notifier};
pub use store::{MedicationStore, MemoryStore};
pub use sweeper::MissedDoseSweeper;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
