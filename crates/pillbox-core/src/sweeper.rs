//! Background missed-dose sweeper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::MedicationStatusEngine;

/// Runs `sweep_missed_doses` on a fixed interval, sends the daily summary
/// once it is due and, every `emergency_every` ticks, runs the emergency
/// checks.
pub struct MissedDoseSweeper {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl MissedDoseSweeper {
    pub fn spawn(engine: Arc<MedicationStatusEngine>, interval: Duration) -> Self {
        Self::spawn_with_emergency_checks(engine, interval, 12)
    }

    pub fn spawn_with_emergency_checks(
        engine: Arc<MedicationStatusEngine>,
        interval: Duration,
        emergency_every: u64,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());

        let handle = tokio::spawn({
            let running = running.clone();
            let wake = wake.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                let mut ticks: u64 = 0;
                info!(interval_secs = interval.as_secs(), "Missed-dose sweeper started");

                while running.load(Ordering::SeqCst) {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = wake.notified() => continue,
                    }
                    ticks += 1;

                    match engine.sweep_now().await {
                        Ok(created) if !created.is_empty() => {
                            info!(count = created.len(), "Recorded missed doses");
                        }
                        Ok(_) => {}
                        Err(e) => error!("Missed-dose sweep failed: {}", e),
                    }

                    if let Err(e) = engine.daily_summary_if_due(engine.now()).await {
                        error!("Daily summary failed: {}", e);
                    }

                    if emergency_every > 0 && ticks % emergency_every == 0 {
                        if let Err(e) = engine.check_emergency_conditions().await {
                            error!("Emergency check failed: {}", e);
                        }
                    }
                }
                info!("Missed-dose sweeper stopped");
            }
        });

        Self {
            running,
            wake,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for MissedDoseSweeper {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
