//! Command-line host for the pillbox.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use pillbox_core::config::{env_vars, DEFAULT_CONFIG_FILE};
use pillbox_core::{
    ContactLogNotifier, MedicationSchedule, MedicationStatusEngine, MemoryStore,
    MissedDoseSweeper, PillboxConfig, MEDICATIONS,
};
use pillbox_devices::{
    channel, CommandResponse, CommandStatus, DeviceSession, DiscoveryService, MessageReceiver,
    MonitorEvent, PillboxMonitor, ScheduleCommandBuilder,
};
use tracing::{info, warn};

/// Pillbox host - discover, talk to and track a networked pillbox.
#[derive(Parser, Debug)]
#[command(name = "pillbox")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = env_vars::CONFIG_PATH,
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Pillbox address; skips discovery.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Pillbox TCP port, used with --host.
    #[arg(long, global = true)]
    port: Option<u16>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a discovery query and print the reply.
    Discover {
        /// Save the address as the fallback for later runs.
        #[arg(long)]
        save: bool,
    },
    /// Connect and print every message the pillbox sends.
    Listen,
    /// Connect and record doses from compartment events.
    Monitor {
        /// JSON array of medication schedules.
        #[arg(short, long)]
        schedules: PathBuf,
    },
    /// Set the pillbox clock (defaults to the host's local time).
    SetTime {
        /// "YYYY-MM-DD HH:MM:SS"
        datetime: Option<String>,
    },
    /// Push the active schedules to the pillbox.
    SendSchedule {
        /// JSON array of medication schedules.
        #[arg(short, long)]
        schedules: PathBuf,
    },
    /// Show a text message on the pillbox screen.
    Message {
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("pillbox=info")
            .add_directive(tracing::Level::INFO.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    let mut config = PillboxConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.apply_env_overrides();

    match args.command {
        Command::Discover { save } => run_discover(&mut config, &args.config, save).await,
        Command::Listen => {
            let (session, receiver) =
                open_session(&mut config, &args.config, args.host, args.port).await?;
            run_listen(session, receiver).await
        }
        Command::Monitor { schedules } => {
            let schedules = load_schedules(&schedules)?;
            let (session, receiver) =
                open_session(&mut config, &args.config, args.host, args.port).await?;
            run_monitor(&config, session, receiver, schedules).await
        }
        Command::SetTime { datetime } => {
            let at = match datetime {
                Some(raw) => NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
                    .with_context(|| format!("Invalid datetime '{}'", raw))?,
                None => Local::now().naive_local(),
            };
            let (session, _receiver) =
                open_session(&mut config, &args.config, args.host, args.port).await?;
            let response = session.set_time(at).await;
            session.disconnect().await;
            report(&response)
        }
        Command::SendSchedule { schedules } => {
            let schedules = load_schedules(&schedules)?;
            let command = ScheduleCommandBuilder::build(&schedules)?;
            let (session, _receiver) =
                open_session(&mut config, &args.config, args.host, args.port).await?;

            let compartments: BTreeMap<String, String> = MEDICATIONS
                .iter()
                .enumerate()
                .map(|(index, (id, _))| (index.to_string(), id.to_string()))
                .collect();
            session.send_medication_config(compartments).await?;

            let response = session.send_schedule(&command).await;
            session.disconnect().await;
            for (medication_id, compartment) in ScheduleCommandBuilder::assignments(&response) {
                match compartment {
                    Some(index) => println!("{} -> box {}", medication_id, index),
                    None => println!("{} -> not assigned", medication_id),
                }
            }
            report(&response)
        }
        Command::Message { text } => {
            let (session, _receiver) =
                open_session(&mut config, &args.config, args.host, args.port).await?;
            session.send_simple_message(&text).await?;
            session.disconnect().await;
            println!("Sent");
            Ok(())
        }
    }
}

async fn run_discover(config: &mut PillboxConfig, path: &Path, save: bool) -> Result<()> {
    let service = DiscoveryService::new(&config.discovery)?;
    let reply = service.discover().await?;

    println!("Device:  {}", reply.device_name);
    println!("Address: {}", reply.socket_addr());
    println!("Boxes:   {}", reply.compartment_count);
    println!("Time:    {}", reply.device_time);

    if save {
        config.remember_device(path, &reply.address.to_string(), reply.port)?;
    }
    Ok(())
}

/// Resolve the pillbox address and connect.
///
/// An explicit --host wins; otherwise discovery runs and falls back to the
/// saved address.
async fn open_session(
    config: &mut PillboxConfig,
    path: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(DeviceSession, MessageReceiver)> {
    let (ip, port) = match host {
        Some(host) => (host, port.unwrap_or(config.pillbox_port)),
        None => {
            let service = DiscoveryService::new(&config.discovery)?;
            service
                .discover_or_fallback(config, Some(path))
                .await
                .context("Pillbox not found and no saved address")?
        }
    };

    let (router, receiver) = channel();
    let session = DeviceSession::new(&config.session, router);
    session.connect(&ip, port).await?;
    Ok((session, receiver))
}

async fn run_listen(session: DeviceSession, mut receiver: MessageReceiver) -> Result<()> {
    println!("Listening, Ctrl-C to stop");
    loop {
        tokio::select! {
            envelope = receiver.recv() => match envelope {
                Some(envelope) => println!("[{}] {:?}", envelope.seq, envelope.message),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        if !session.is_connected() && receiver.is_empty() {
            warn!("Connection lost");
            break;
        }
    }
    session.disconnect().await;
    Ok(())
}

async fn run_monitor(
    config: &PillboxConfig,
    session: DeviceSession,
    receiver: MessageReceiver,
    schedules: Vec<MedicationSchedule>,
) -> Result<()> {
    let store = Arc::new(MemoryStore::with_schedules(schedules));
    let notifier = Arc::new(ContactLogNotifier::new(config.family_contacts.clone()));
    let engine = Arc::new(
        MedicationStatusEngine::from_config(store, &config.medication).with_notifier(notifier),
    );

    let mut sweeper = MissedDoseSweeper::spawn_with_emergency_checks(
        engine.clone(),
        config.medication.sweep_interval(),
        12,
    );

    if let Err(e) = session.request_status().await {
        warn!("Status request failed: {}", e);
    }

    let monitor = PillboxMonitor::new(receiver, engine.clone());
    let monitor_task = tokio::spawn(monitor.run(|event| match event {
        MonitorEvent::DoseRecorded(record) => println!(
            "{} {} scheduled {} -> {} ({})",
            record.medication_id,
            record.scheduled_date,
            record.scheduled_time.format("%H:%M"),
            record.status,
            record.notes
        ),
        MonitorEvent::Unscheduled { compartment } => {
            println!("Box {} opened, no active schedule", compartment)
        }
        MonitorEvent::RecordFailed { compartment, error } => {
            println!("Box {} opened, not recorded: {}", compartment, error)
        }
        MonitorEvent::BoxClosed { .. } | MonitorEvent::Device(_) => {}
    }));

    println!("Monitoring, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    sweeper.stop().await;
    session.disconnect().await;
    drop(session);
    if let Err(e) = monitor_task.await {
        warn!("Monitor task failed: {}", e);
    }

    let summary = engine.today_summary().await?;
    info!(
        scheduled = summary.total_scheduled,
        taken = summary.taken,
        missed = summary.missed,
        pending = summary.pending,
        "Today"
    );

    let today = engine.now().date();
    let month = engine
        .monthly_statistics(today.year(), today.month())
        .await?;
    info!(
        scheduled = month.total_scheduled,
        taken = month.taken,
        adherence = format!("{:.1}%", month.adherence_rate),
        perfect_days = month.perfect_days,
        days = month.days_with_schedule,
        "This month"
    );
    Ok(())
}

fn load_schedules(path: &Path) -> Result<Vec<MedicationSchedule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let schedules = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid schedule file {}", path.display()))?;
    Ok(schedules)
}

fn report(response: &CommandResponse) -> Result<()> {
    match response.status {
        CommandStatus::Ok => {
            println!("OK");
            Ok(())
        }
        CommandStatus::Timeout => anyhow::bail!(
            "No response from pillbox; the command may or may not have been applied"
        ),
        CommandStatus::Error => anyhow::bail!(
            "Pillbox rejected the command: {}",
            response.message.as_deref().unwrap_or("no reason given")
        ),
    }
}
