use anyhow::{Result, anyhow};
use chrono::Local;
use clap::{Parser, Subcommand};
use speaking_clock::VERSION;
use speaking_clock::bus::ControlMessage;
use speaking_clock::config::{Config, get_config_path, load_config, save_config};
use speaking_clock::control::{ControlServer, deliver};
use speaking_clock::executor::AnnounceOutcome;
use speaking_clock::formatter::format_time;
use speaking_clock::health::{CheckLevel, run_doctor};
use speaking_clock::model::{TimeOfDay, VoiceSettings};
use speaking_clock::platform::{BackupAlarm, PersistedBackupAlarm};
use speaking_clock::schedule::upcoming;
use speaking_clock::service::{ClockService, build_trigger, open_preferences, status_snapshot};
use speaking_clock::store::Preferences;
use speaking_clock::survival::{
    BackupAlarmAction, BootAction, BootEvent, PrimaryLock, backup_alarm_decision, on_boot,
};
use speaking_clock::trigger::TriggerLoop;
use speaking_clock::utils::{describe_ms, ensure_dir, now_ms, parse_hh_mm};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "speaking-clock",
    about = "Speaks the time aloud at regular wall-clock intervals"
)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the config and preference files
    Init,
    /// Run the primary announcement loop until interrupted
    Run,
    Status,
    /// Arm the schedule with the stored interval
    Start,
    /// Disable scheduled announcements
    Stop,
    /// Speak the current time now
    Speak,
    /// Preview upcoming announcement times
    Next {
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
    Set {
        #[command(subcommand)]
        setting: SetCommand,
    },
    /// Boot hook entry point for the host's auto-start mechanism
    Boot {
        #[arg(short, long, default_value = "boot-completed")]
        event: BootEvent,
        /// Spawn the primary loop when the schedule is armed
        #[arg(long, default_value_t = false)]
        launch: bool,
    },
    /// Backup alarm entry point, invoked by a periodic host timer
    Alarm,
    Doctor {
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
    Version,
}

#[derive(Debug, Subcommand)]
enum SetCommand {
    /// Minutes between announcements, 0 disables
    Interval { minutes: u32 },
    Quiet {
        /// HH:MM
        #[arg(long)]
        start: Option<String>,
        /// HH:MM
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value_t = false)]
        off: bool,
    },
    Voice {
        #[arg(short, long)]
        language: Option<String>,
        #[arg(long)]
        volume: Option<f32>,
        #[arg(long)]
        rate: Option<f32>,
    },
    Repeat { count: u32 },
    Vibration {
        #[arg(value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
    /// 12, 24 or auto
    Clock { format: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init()?,
        Commands::Run => cmd_run().await?,
        Commands::Status => cmd_status()?,
        Commands::Start => cmd_apply(ControlMessage::Start).await?,
        Commands::Stop => cmd_apply(ControlMessage::Stop).await?,
        Commands::Speak => cmd_speak().await?,
        Commands::Next { count } => cmd_next(count)?,
        Commands::Set { setting } => cmd_set(setting).await?,
        Commands::Boot { event, launch } => cmd_boot(event, launch).await?,
        Commands::Alarm => cmd_alarm().await?,
        Commands::Doctor { fix } => cmd_doctor(fix).await?,
        Commands::Version => println!("speaking-clock v{VERSION}"),
    }
    Ok(())
}

fn load() -> Result<(Config, Preferences)> {
    let config = load_config(None).unwrap_or_else(|err| {
        tracing::warn!("Config unreadable, using defaults: {err:#}");
        Config::default()
    });
    let prefs = open_preferences(&config)?;
    Ok((config, prefs))
}

fn trigger() -> Result<(Config, Arc<TriggerLoop>)> {
    let (config, prefs) = load()?;
    let trigger = build_trigger(&config, prefs)?;
    Ok((config, trigger))
}

fn cmd_init() -> Result<()> {
    let config_path = get_config_path()?;
    let config = if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        load_config(Some(&config_path))?
    } else {
        let config = Config::default();
        save_config(&config, Some(&config_path))?;
        println!("Created config at {}", config_path.display());
        config
    };

    let prefs_path = config.prefs_path()?;
    if !prefs_path.exists() {
        if let Some(parent) = prefs_path.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(&prefs_path, "{}\n")?;
        println!("Created {}", prefs_path.display());
    }

    println!("speaking-clock is ready.");
    println!("Next steps:");
    println!("1. Choose an interval: speaking-clock set interval 15");
    println!("2. Keep the loop running: speaking-clock run");
    println!("3. Register `speaking-clock boot --launch` and `speaking-clock alarm` with your");
    println!("   init system so the loop survives reboots and crashes.");
    Ok(())
}

async fn cmd_run() -> Result<()> {
    let (config, trigger) = trigger()?;
    let lock_path = config.primary_lock_path()?;
    let Some(primary) = PrimaryLock::acquire(&lock_path)? else {
        match PrimaryLock::holder_pid(&lock_path) {
            Some(pid) => println!("speaking-clock is already running (pid {pid})"),
            None => println!("speaking-clock is already running"),
        }
        return Ok(());
    };
    info!("Holding {}", primary.path().display());
    info!("Speech backend: {}", trigger.executor().speech_backend());

    let service = ClockService::new(&config.runtime, trigger);
    service.start().await?;
    let control = match ControlServer::bind(config.control_endpoint_path()?).await {
        Ok(control) => {
            control.start(service.bus()).await;
            Some(control)
        }
        Err(err) => {
            warn!("Control socket unavailable, settings apply through the store only: {err:#}");
            None
        }
    };
    println!("speaking-clock running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    if let Some(control) = control {
        control.stop().await;
    }
    service.shutdown().await;
    drop(primary);
    Ok(())
}

/// Routes `msg` through the running primary loop when there is one.
async fn send_to_primary(config: &Config, msg: &ControlMessage) -> Result<bool> {
    deliver(
        &config.primary_lock_path()?,
        &config.control_endpoint_path()?,
        msg,
        config.runtime.control_timeout(),
    )
    .await
}

fn cmd_status() -> Result<()> {
    let (config, prefs) = load()?;
    let status = status_snapshot(&prefs, &config.runtime, now_ms());

    println!("speaking-clock Status");
    println!("State: {}", status.state);
    if status.interval_minutes == 0 {
        println!("Interval: off");
    } else {
        println!("Interval: every {} min", status.interval_minutes);
    }
    println!("Repeat: {}x", status.repeat_count);
    println!("Language: {}", status.language);
    if status.quiet.enabled {
        println!("Quiet hours: {} - {}", status.quiet.start, status.quiet.end);
    } else {
        println!("Quiet hours: off");
    }
    println!("Next: {}", describe_ms(status.next_announcement));
    println!("Last: {}", describe_ms(status.last_announcement));
    println!(
        "Primary loop: {} (heartbeat {})",
        if status.primary_alive { "ALIVE" } else { "NOT RUNNING" },
        describe_ms(status.last_heartbeat)
    );
    println!(
        "Backup alarm: {}",
        match status.backup_alarm_minutes {
            Some(minutes) => format!("every {minutes} min"),
            None => "off".to_string(),
        }
    );
    if let Some(text) = status.last_spoken_text {
        println!("Last spoken: {text}");
    }
    Ok(())
}

async fn cmd_apply(msg: ControlMessage) -> Result<()> {
    let (config, trigger) = trigger()?;
    if send_to_primary(&config, &msg).await? {
        println!("Sent to the running primary loop");
        return Ok(());
    }
    let state = trigger.apply(msg, Local::now()).await?;
    let next = trigger.prefs().schedule_state().next_announcement_ms;
    println!("Schedule {state}, next: {}", describe_ms(next));
    Ok(())
}

async fn cmd_speak() -> Result<()> {
    let (config, trigger) = trigger()?;
    if send_to_primary(&config, &ControlMessage::AnnounceNow).await? {
        println!("Announcement requested from the running primary loop");
        return Ok(());
    }
    match trigger.announce_now(Local::now()).await {
        AnnounceOutcome::Completed { spoken, failed } => {
            println!("Spoke {spoken} time(s), {failed} failure(s)");
        }
        AnnounceOutcome::Busy => println!("An announcement is already in progress"),
    }
    Ok(())
}

fn cmd_next(count: usize) -> Result<()> {
    let (_, prefs) = load()?;
    let config = prefs.schedule_config();
    if !config.is_enabled() {
        println!("Scheduled announcements are off. Set one with `speaking-clock set interval 15`.");
        return Ok(());
    }
    let quiet = prefs.quiet_window();
    for at in upcoming(config.interval_minutes, &Local::now(), count) {
        let text = format_time(&at, &config.voice.language, config.use_24_hour);
        let flag = if quiet.contains(&at) { " (quiet)" } else { "" };
        println!("{}  {}{flag}", at.format("%Y-%m-%d"), text.display);
    }
    Ok(())
}

async fn cmd_set(setting: SetCommand) -> Result<()> {
    let (config, trigger) = trigger()?;
    let current = trigger.prefs().schedule_config();
    let msg = match setting {
        SetCommand::Interval { minutes } => ControlMessage::SetInterval(minutes),
        SetCommand::Quiet { start, end, off } => {
            let mut window = trigger.prefs().quiet_window();
            if off {
                window.enabled = false;
            } else {
                if let Some(start) = start {
                    let (h, m) = parse_hh_mm(&start)?;
                    window.start = TimeOfDay::new(h, m);
                }
                if let Some(end) = end {
                    let (h, m) = parse_hh_mm(&end)?;
                    window.end = TimeOfDay::new(h, m);
                }
                window.enabled = true;
            }
            ControlMessage::SetQuietWindow(window)
        }
        SetCommand::Voice {
            language,
            volume,
            rate,
        } => ControlMessage::SetVoice(VoiceSettings {
            language: language.unwrap_or(current.voice.language),
            volume: volume.unwrap_or(current.voice.volume),
            rate: rate.unwrap_or(current.voice.rate),
        }),
        SetCommand::Repeat { count } => ControlMessage::SetRepeatCount(count),
        SetCommand::Vibration { enabled } => ControlMessage::SetVibration(enabled),
        SetCommand::Clock { format } => ControlMessage::SetClockFormat(match format.trim() {
            "12" => Some(false),
            "24" => Some(true),
            "auto" => None,
            other => return Err(anyhow!("clock format must be 12, 24 or auto, got {other}")),
        }),
    };
    if send_to_primary(&config, &msg).await? {
        println!("Saved. Sent to the running primary loop");
        return Ok(());
    }
    let state = trigger.apply(msg, Local::now()).await?;
    println!("Saved. Schedule {state}");
    Ok(())
}

fn spawn_primary() -> Result<()> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    info!("Spawned primary loop (pid {:?})", child.id());
    Ok(())
}

async fn cmd_boot(event: BootEvent, launch: bool) -> Result<()> {
    let (config, prefs) = load()?;
    match on_boot(&prefs, event, now_ms())? {
        BootAction::Relaunch if launch && PrimaryLock::is_held(&config.primary_lock_path()?)? => {
            println!("Primary loop already running");
        }
        BootAction::Relaunch if launch => {
            spawn_primary()?;
            println!("Primary loop relaunched after {event}");
        }
        BootAction::Relaunch => println!("Schedule armed; relaunch the primary loop"),
        BootAction::Ignore => println!("Schedule disabled; nothing to do"),
    }
    Ok(())
}

async fn cmd_alarm() -> Result<()> {
    let (config, prefs) = load()?;
    let primary_running = PrimaryLock::is_held(&config.primary_lock_path()?)?;
    match backup_alarm_decision(
        &prefs,
        now_ms(),
        config.runtime.liveness_window_ms(),
        primary_running,
    ) {
        BackupAlarmAction::Disarmed => {
            if prefs.backup_alarm().is_some() {
                PersistedBackupAlarm::new(prefs).cancel()?;
            }
            println!("Schedule disabled; backup alarm is idle");
        }
        BackupAlarmAction::PrimaryAlive => println!("Primary loop alive"),
        BackupAlarmAction::Restart => {
            spawn_primary()?;
            println!("Primary loop restarted");
        }
    }
    Ok(())
}

async fn cmd_doctor(fix: bool) -> Result<()> {
    let result = run_doctor(fix).await?;
    for action in &result.actions {
        println!("fixed: {action}");
    }
    for check in &result.report.checks {
        let level = match check.level {
            CheckLevel::Ok => "OK  ",
            CheckLevel::Warn => "WARN",
            CheckLevel::Fail => "FAIL",
        };
        println!("[{level}] {}: {}", check.label, check.detail);
        if let Some(hint) = &check.fix_hint {
            println!("       {hint}");
        }
    }
    let summary = &result.report.summary;
    println!(
        "{} ok, {} warning(s), {} failure(s)",
        summary.ok, summary.warn, summary.fail
    );
    Ok(())
}
