//! Primary loop host: wires the platform capabilities together and drives
//! [`TriggerLoop`] from a poll timer and the in-process control bus.

use crate::bus::ControlBus;
use crate::config::{Config, RuntimeConfig};
use crate::executor::AnnouncementExecutor;
use crate::heartbeat::HealthMonitor;
use crate::model::{LoopState, QuietWindow};
use crate::platform::{NoVibrator, PersistedBackupAlarm, build_notifier, build_speech};
use crate::store::{JsonFileStore, Preferences};
use crate::survival::primary_alive;
use crate::trigger::{TickOutcome, TriggerLoop, TriggerSource};
use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// File-backed preferences at the configured data directory.
pub fn open_preferences(config: &Config) -> Result<Preferences> {
    let path = config.prefs_path()?;
    Ok(Preferences::new(Arc::new(JsonFileStore::open(path))))
}

/// Builds the trigger loop with the host's real capabilities.
pub fn build_trigger(config: &Config, prefs: Preferences) -> Result<Arc<TriggerLoop>> {
    let speech = build_speech(&config.speech);
    let notifier = build_notifier(config)?;
    let executor = Arc::new(AnnouncementExecutor::new(
        &config.announcer,
        &config.speech.fallback_language,
        speech,
        Arc::new(NoVibrator),
        notifier,
        prefs.clone(),
    ));
    let alarm = Arc::new(PersistedBackupAlarm::new(prefs.clone()));
    Ok(Arc::new(TriggerLoop::new(
        &config.runtime,
        prefs,
        executor,
        alarm,
    )))
}

pub struct ClockService {
    trigger: Arc<TriggerLoop>,
    bus: Arc<ControlBus>,
    monitor: HealthMonitor,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ClockService {
    pub fn new(runtime: &RuntimeConfig, trigger: Arc<TriggerLoop>) -> Self {
        Self {
            monitor: HealthMonitor::new(trigger.clone(), runtime.health_check_interval()),
            trigger,
            bus: Arc::new(ControlBus::new(runtime.control_queue_capacity)),
            poll_interval: runtime.poll_interval(),
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bus(&self) -> Arc<ControlBus> {
        self.bus.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let outcome = self.trigger.health_check(Local::now()).await;
        info!("Primary loop started ({}): {outcome:?}", self.trigger.loop_state());

        let running = self.running.clone();
        let trigger = self.trigger.clone();
        let bus = self.bus.clone();
        let poll_interval = self.poll_interval;

        let runner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = ticker.tick() => {
                        match trigger.tick(Local::now(), TriggerSource::Primary).await {
                            TickOutcome::Waiting { .. } | TickOutcome::Disabled => {}
                            outcome => debug!("Tick: {outcome:?}"),
                        }
                    }
                    msg = bus.consume() => {
                        let Some(msg) = msg else {
                            break;
                        };
                        debug!("Control message: {msg:?}");
                        match trigger.apply(msg, Local::now()).await {
                            Ok(state) => debug!("Loop state after message: {state}"),
                            Err(err) => warn!("Failed to apply control message: {err:#}"),
                        }
                    }
                }
            }
        });

        let mut slot = self.task.lock().await;
        *slot = Some(runner);
        drop(slot);

        self.monitor.start().await;
        Ok(())
    }

    /// Stops the in-process tasks. The persisted schedule is left armed, so
    /// the backup alarm or the next boot brings the loop back.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.monitor.stop().await;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: String,
    pub interval_minutes: u32,
    pub repeat_count: u32,
    pub language: String,
    pub quiet: QuietWindow,
    pub next_announcement: Option<i64>,
    pub last_announcement: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub primary_alive: bool,
    pub backup_alarm_minutes: Option<u32>,
    pub last_spoken_text: Option<String>,
}

pub fn status_snapshot(prefs: &Preferences, runtime: &RuntimeConfig, now_ms: i64) -> StatusSnapshot {
    prefs.reload();
    let config = prefs.schedule_config();
    let state = prefs.schedule_state();
    StatusSnapshot {
        state: LoopState::of(&config, &state).to_string(),
        interval_minutes: config.interval_minutes,
        repeat_count: config.repeat_count,
        language: config.voice.language,
        quiet: prefs.quiet_window(),
        next_announcement: state.next_announcement_ms,
        last_announcement: state.last_announcement_ms,
        last_heartbeat: state.last_heartbeat_ms,
        primary_alive: primary_alive(state.last_heartbeat_ms, now_ms, runtime.liveness_window_ms()),
        backup_alarm_minutes: prefs.backup_alarm(),
        last_spoken_text: prefs.last_spoken_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ControlMessage;
    use crate::config::AnnouncerConfig;
    use crate::platform::testing::{
        RecordingAlarm, RecordingNotifier, RecordingSpeech, RecordingVibrator,
    };
    use crate::store::PrefKey;
    use crate::utils::now_ms;
    use serde_json::Value;

    fn service(prefs: &Preferences, speech: Arc<RecordingSpeech>) -> ClockService {
        let executor = Arc::new(AnnouncementExecutor::new(
            &AnnouncerConfig::default(),
            "en",
            speech,
            Arc::new(RecordingVibrator::new(false)),
            Arc::new(RecordingNotifier::default()),
            prefs.clone(),
        ));
        let runtime = RuntimeConfig::default();
        let trigger = Arc::new(TriggerLoop::new(
            &runtime,
            prefs.clone(),
            executor,
            Arc::new(RecordingAlarm::default()),
        ));
        ClockService::new(&runtime, trigger)
    }

    #[tokio::test]
    async fn control_messages_change_loop_state() -> Result<()> {
        let prefs = Preferences::in_memory();
        let service = service(&prefs, Arc::new(RecordingSpeech::default()));
        service.start().await?;
        assert!(service.is_running());

        let bus = service.bus();
        bus.publish(ControlMessage::SetInterval(15)).await?;
        while bus.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = status_snapshot(&prefs, &RuntimeConfig::default(), now_ms());
        assert_eq!(status.state, "ARMED");
        assert!(status.next_announcement.unwrap_or_default() > now_ms());

        bus.publish(ControlMessage::Stop).await?;
        while bus.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = status_snapshot(&prefs, &RuntimeConfig::default(), now_ms());
        assert_eq!(status.state, "DISABLED");
        assert_eq!(status.next_announcement, None);

        service.shutdown().await;
        assert!(!service.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn startup_repairs_schedule_and_beats() -> Result<()> {
        let prefs = Preferences::in_memory();
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(15)),
            (PrefKey::ServiceRunning, Value::from(true)),
            (PrefKey::NextAnnouncementTime, Value::from(now_ms() - 3 * 3_600_000)),
        ])?;
        let service = service(&prefs, Arc::new(RecordingSpeech::default()));
        service.start().await?;

        let status = status_snapshot(&prefs, &RuntimeConfig::default(), now_ms());
        assert!(status.next_announcement.unwrap_or_default() > now_ms());
        assert!(status.primary_alive);
        service.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn announce_now_through_bus() -> Result<()> {
        let prefs = Preferences::in_memory();
        let speech = Arc::new(RecordingSpeech::default());
        let service = service(&prefs, speech.clone());
        service.start().await?;

        prefs.write(&[(PrefKey::RepeatCount, Value::from(1))])?;
        service.bus().publish(ControlMessage::AnnounceNow).await?;
        for _ in 0..100 {
            if speech.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(speech.count(), 1);
        assert!(prefs.last_spoken_text().is_some());
        service.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn foreground_message_over_socket_reaches_the_loop() -> Result<()> {
        use crate::control::{ControlServer, send};

        let prefs = Preferences::in_memory();
        let service = service(&prefs, Arc::new(RecordingSpeech::default()));
        service.start().await?;
        let endpoint = std::env::temp_dir()
            .join(format!("speaking-clock-control-{}.json", uuid::Uuid::new_v4()));
        let control = ControlServer::bind(endpoint.clone()).await?;
        control.start(service.bus()).await;

        let reply = send(&endpoint, &ControlMessage::SetInterval(30), Duration::from_secs(5)).await?;
        assert!(reply.is_some_and(|r| r.ok));
        for _ in 0..100 {
            if prefs.schedule_config().interval_minutes == 30 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = status_snapshot(&prefs, &RuntimeConfig::default(), now_ms());
        assert_eq!(status.interval_minutes, 30);
        assert_eq!(status.state, "ARMED");

        control.stop().await;
        service.shutdown().await;
        Ok(())
    }
}
