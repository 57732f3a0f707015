//! Host configuration.
//!
//! A single `PillboxConfig` is loaded once at startup and handed by
//! reference to the discovery service, the device session and the engine.
//! The same JSON document doubles as the discovery fallback store: the
//! top-level `pillbox_ip` / `pillbox_port` keys are written whenever
//! discovery succeeds and read back when it fails.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::medication::MedicationStatus;
use crate::notify::FamilyContact;

/// Default TCP port of the pillbox session server.
pub const DEFAULT_PILLBOX_PORT: u16 = 8080;
/// Default UDP port the pillbox listens on for discovery queries.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;
/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "system_config.json";

/// Environment variable names
pub mod env_vars {
    pub const PILLBOX_IP: &str = "PILLBOX_IP";
    pub const PILLBOX_PORT: &str = "PILLBOX_PORT";
    pub const CONFIG_PATH: &str = "PILLBOX_CONFIG";
    pub const LOG_JSON: &str = "PILLBOX_LOG_JSON";
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PillboxConfig {
    /// Last known pillbox address, used when discovery fails
    #[serde(default)]
    pub pillbox_ip: Option<String>,
    #[serde(default = "default_pillbox_port")]
    pub pillbox_port: u16,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub medication: MedicationPolicyConfig,
    #[serde(default)]
    pub family_contacts: Vec<FamilyContact>,
    /// Keys owned by other tools, preserved on save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_pillbox_port() -> u16 {
    DEFAULT_PILLBOX_PORT
}

impl Default for PillboxConfig {
    fn default() -> Self {
        Self {
            pillbox_ip: None,
            pillbox_port: DEFAULT_PILLBOX_PORT,
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
            medication: MedicationPolicyConfig::default(),
            family_contacts: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl PillboxConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Write the whole document back, pretty-printed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Persisted address to try when discovery finds nothing.
    pub fn fallback_address(&self) -> Option<(String, u16)> {
        self.pillbox_ip
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .map(|ip| (ip.clone(), self.pillbox_port))
    }

    /// Record a discovered address in memory and on disk.
    ///
    /// The file is re-read first so keys written by other tools since
    /// startup survive.
    pub fn remember_device(&mut self, path: impl AsRef<Path>, ip: &str, port: u16) -> Result<()> {
        let path = path.as_ref();
        let mut on_disk = Self::load(path)?;
        on_disk.pillbox_ip = Some(ip.to_string());
        on_disk.pillbox_port = port;
        on_disk.save(path)?;

        self.pillbox_ip = Some(ip.to_string());
        self.pillbox_port = port;
        info!(ip = %ip, port, path = %path.display(), "Saved pillbox address");
        Ok(())
    }

    /// Apply `PILLBOX_IP` / `PILLBOX_PORT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(ip) = std::env::var(env_vars::PILLBOX_IP) {
            if !ip.is_empty() {
                self.pillbox_ip = Some(ip);
            }
        }
        if let Some(port) = std::env::var(env_vars::PILLBOX_PORT)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.pillbox_port = port;
        }
    }
}

/// UDP discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub udp_port: u16,
    pub broadcast_address: String,
    /// Wait for a reply per attempt, in seconds
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
    /// ASCII query token
    pub query: String,
    /// Expected `device` field in the reply
    pub device_kind: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: "255.255.255.255".to_string(),
            timeout_secs: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            query: "DISCOVER_ESP32".to_string(),
            device_kind: "ESP32-Pillbox".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// TCP session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    /// Receive-loop read bound; also the stop-flag latency
    pub poll_interval_ms: u64,
    pub command_timeout_secs: u64,
    /// Longest line accepted before the buffer is discarded
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            poll_interval_ms: 1000,
            command_timeout_secs: 5,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Status classification and sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicationPolicyConfig {
    pub on_time_minutes: i64,
    pub late_minutes: i64,
    /// Status for sensor-confirmed doses later than `late_minutes`
    pub late_status: MedicationStatus,
    pub missed_grace_secs: i64,
    pub sweep_interval_secs: u64,
    pub low_adherence_percent: f64,
    pub adherence_window_days: u32,
    /// Local hour from which the day's summary goes out, once per day
    pub daily_summary_hour: u32,
}

impl Default for MedicationPolicyConfig {
    fn default() -> Self {
        Self {
            on_time_minutes: 15,
            late_minutes: 30,
            late_status: MedicationStatus::Taken,
            missed_grace_secs: 60,
            sweep_interval_secs: 300,
            low_adherence_percent: 50.0,
            adherence_window_days: 7,
            daily_summary_hour: 21,
        }
    }
}

impl MedicationPolicyConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
