//! Announcement trigger loop.
//!
//! An explicit state machine with two logical states, driven by three
//! transition functions:
//!
//! - [`TriggerLoop::tick`]: one poll period elapsed (or a wake source fired).
//! - [`TriggerLoop::apply`]: a settings message arrived.
//! - [`TriggerLoop::ensure_armed`]: a recovery source (startup, boot,
//!   backup alarm, health check) wants the schedule to be consistent.
//!
//! ```text
//!              SetInterval(n > 0) / Start
//!   Disabled ─────────────────────────────► Armed ──┐ tick: now >= next
//!      ▲                                      ▲     │   quiet  -> advance next
//!      │      SetInterval(0) / Stop           │     │   else   -> advance next,
//!      └──────────────────────────────────────┘◄────┘             record last, announce
//! ```
//!
//! Every transition starts by reloading the persisted preferences, so
//! changes written by another process are honoured within one poll period.
//! The next boundary is persisted before the executor runs, so a crash
//! mid-announcement never replays the same boundary.

use crate::bus::ControlMessage;
use crate::config::RuntimeConfig;
use crate::executor::{AnnounceOutcome, AnnouncementExecutor, AnnouncementRequest};
use crate::formatter::format_time;
use crate::model::{
    LoopState, MAX_REPEAT_COUNT, MIN_REPEAT_COUNT, MINUTES_PER_DAY, ScheduleConfig, VoiceSettings,
};
use crate::platform::BackupAlarm;
use crate::schedule::next_boundary;
use crate::store::{PrefKey, Preferences};
use crate::utils::{local_from_ms, secs_to_ms};
use anyhow::Result;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Primary,
    BackupAlarm,
    HealthCheck,
    Boot,
    Startup,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::BackupAlarm => write!(f, "backup-alarm"),
            Self::HealthCheck => write!(f, "health-check"),
            Self::Boot => write!(f, "boot"),
            Self::Startup => write!(f, "startup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    Waiting { next_ms: i64 },
    /// Armed without a usable next time; one was computed.
    Scheduled { next_ms: i64 },
    QuietSkipped { next_ms: i64 },
    /// A wake source fired too soon after the previous announcement.
    Suppressed { next_ms: i64 },
    Announced { next_ms: i64, outcome: AnnounceOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Disabled,
    Armed { next_ms: i64 },
    Rescheduled { next_ms: i64, previous_ms: Option<i64> },
}

pub struct TriggerLoop {
    prefs: Preferences,
    executor: Arc<AnnouncementExecutor>,
    alarm: Arc<dyn BackupAlarm>,
    guard_ms: i64,
    grace_ms: i64,
    transition: Mutex<()>,
    // Survives failed writes so this process never fires a boundary twice.
    last_fired_ms: StdMutex<Option<i64>>,
}

impl TriggerLoop {
    pub fn new(
        runtime: &RuntimeConfig,
        prefs: Preferences,
        executor: Arc<AnnouncementExecutor>,
        alarm: Arc<dyn BackupAlarm>,
    ) -> Self {
        Self {
            prefs,
            executor,
            alarm,
            guard_ms: secs_to_ms(runtime.double_fire_guard_secs),
            grace_ms: secs_to_ms(runtime.health_grace_secs),
            transition: Mutex::new(()),
            last_fired_ms: StdMutex::new(None),
        }
    }

    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn executor(&self) -> &Arc<AnnouncementExecutor> {
        &self.executor
    }

    pub fn loop_state(&self) -> LoopState {
        LoopState::of(&self.prefs.schedule_config(), &self.prefs.schedule_state())
    }

    fn last_fired(&self) -> Option<i64> {
        *self
            .last_fired_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember_fired(&self, now_ms: i64) {
        *self
            .last_fired_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now_ms);
    }

    fn persist_next(&self, next_ms: i64) {
        if let Err(err) = self.prefs.set_next_announcement(Some(next_ms)) {
            warn!("Failed to persist next announcement time: {err:#}");
        }
    }

    fn reschedule(&self, interval_minutes: u32, now: &DateTime<Local>) -> i64 {
        let next_ms = next_boundary(interval_minutes, now).timestamp_millis();
        self.persist_next(next_ms);
        next_ms
    }

    /// One poll-period transition.
    pub async fn tick(&self, now: DateTime<Local>, source: TriggerSource) -> TickOutcome {
        let (request, next_ms) = {
            let _transition = self.transition.lock().await;
            self.prefs.reload();
            let config = self.prefs.schedule_config();
            let state = self.prefs.schedule_state();
            if LoopState::of(&config, &state) == LoopState::Disabled {
                return TickOutcome::Disabled;
            }

            let now_ms = now.timestamp_millis();
            let Some(due_ms) = state.next_announcement_ms else {
                let next_ms = self.reschedule(config.interval_minutes, &now);
                info!("Armed without a next time ({source}), scheduled {next_ms}");
                return TickOutcome::Scheduled { next_ms };
            };
            if now_ms < due_ms {
                return TickOutcome::Waiting { next_ms: due_ms };
            }

            let next = next_boundary(config.interval_minutes, &now);
            let next_ms = next.timestamp_millis();

            let last_ms = state.last_announcement_ms.max(self.last_fired());
            if let Some(last_ms) = last_ms
                && (0..self.guard_ms).contains(&(now_ms - last_ms))
            {
                debug!("Suppressed {source} trigger {}ms after last announcement", now_ms - last_ms);
                self.persist_next(next_ms);
                return TickOutcome::Suppressed { next_ms };
            }

            if self.prefs.quiet_window().contains(&now) {
                info!("Quiet hours, skipping boundary; next at {}", next.format("%H:%M"));
                self.persist_next(next_ms);
                return TickOutcome::QuietSkipped { next_ms };
            }

            self.remember_fired(now_ms);
            if let Err(err) = self.prefs.write(&[
                (PrefKey::NextAnnouncementTime, Value::from(next_ms)),
                (PrefKey::LastAnnouncementTime, Value::from(now_ms)),
            ]) {
                warn!("Failed to persist schedule before announcing: {err:#}");
            }

            let next_display = format_time(&next, &config.voice.language, config.use_24_hour).display;
            (self.build_request(&config, &now, Some(next_display)), next_ms)
        };

        info!("Boundary reached ({source}), announcing {:?}", request.text.spoken);
        let outcome = self.executor.announce(&request).await;
        TickOutcome::Announced { next_ms, outcome }
    }

    fn build_request(
        &self,
        config: &ScheduleConfig,
        now: &DateTime<Local>,
        next_display: Option<String>,
    ) -> AnnouncementRequest {
        AnnouncementRequest {
            text: format_time(now, &config.voice.language, config.use_24_hour),
            repeat_count: config.repeat_count,
            vibrate: config.vibration_enabled,
            voice: config.voice.clone(),
            next_display,
        }
    }

    /// Idempotent consistency check shared by every recovery source.
    ///
    /// Recomputes the next time when it is missing, older than one interval
    /// plus the grace margin, or further ahead than one interval plus grace
    /// (wall clock moved backwards). Re-registers the backup alarm if the
    /// registration was lost.
    pub async fn ensure_armed(&self, now: DateTime<Local>, source: TriggerSource) -> EnsureOutcome {
        let _transition = self.transition.lock().await;
        self.prefs.reload();
        let config = self.prefs.schedule_config();
        let state = self.prefs.schedule_state();
        if LoopState::of(&config, &state) == LoopState::Disabled {
            return EnsureOutcome::Disabled;
        }

        if self.prefs.backup_alarm() != Some(config.interval_minutes) {
            if let Err(err) = self.alarm.schedule(config.interval_minutes) {
                warn!("Failed to register backup alarm: {err:#}");
            }
        }

        let now_ms = now.timestamp_millis();
        let tolerance_ms = (i64::from(config.interval_minutes) * 60_000).saturating_add(self.grace_ms);
        let stale = match state.next_announcement_ms {
            None => true,
            Some(next_ms) => {
                now_ms.saturating_sub(next_ms) > tolerance_ms
                    || next_ms.saturating_sub(now_ms) > tolerance_ms
            }
        };
        if !stale {
            return EnsureOutcome::Armed {
                next_ms: state.next_announcement_ms.unwrap_or_default(),
            };
        }

        let next_ms = self.reschedule(config.interval_minutes, &now);
        info!(
            "Recomputed schedule ({source}): {} -> {}",
            crate::utils::describe_ms(state.next_announcement_ms),
            crate::utils::describe_ms(Some(next_ms))
        );
        EnsureOutcome::Rescheduled {
            next_ms,
            previous_ms: state.next_announcement_ms,
        }
    }

    /// Periodic self-check: [`ensure_armed`](Self::ensure_armed) plus a
    /// heartbeat for external watchdogs.
    pub async fn health_check(&self, now: DateTime<Local>) -> EnsureOutcome {
        let outcome = self.ensure_armed(now, TriggerSource::HealthCheck).await;
        if let Err(err) = self.prefs.record_heartbeat(now.timestamp_millis()) {
            warn!("Failed to write heartbeat: {err:#}");
        }
        outcome
    }

    /// Speaks the current time on demand. The schedule is left untouched.
    pub async fn announce_now(&self, now: DateTime<Local>) -> AnnounceOutcome {
        self.prefs.reload();
        let config = self.prefs.schedule_config();
        let state = self.prefs.schedule_state();
        let next_display = match LoopState::of(&config, &state) {
            LoopState::Armed => state
                .next_announcement_ms
                .and_then(local_from_ms)
                .map(|next| format_time(&next, &config.voice.language, config.use_24_hour).display),
            LoopState::Disabled => None,
        };
        let request = self.build_request(&config, &now, next_display);
        self.executor.announce(&request).await
    }

    /// Applies a settings message and returns the resulting loop state.
    pub async fn apply(&self, msg: ControlMessage, now: DateTime<Local>) -> Result<LoopState> {
        if msg == ControlMessage::AnnounceNow {
            self.announce_now(now).await;
            return Ok(self.loop_state());
        }

        let _transition = self.transition.lock().await;
        self.prefs.reload();
        match msg {
            ControlMessage::SetInterval(minutes) => {
                let minutes = minutes.min(MINUTES_PER_DAY);
                self.prefs
                    .write(&[(PrefKey::IntervalMinutes, Value::from(minutes))])?;
                if minutes > 0 {
                    self.arm(minutes, &now)?;
                } else {
                    self.disarm()?;
                }
            }
            ControlMessage::Start => {
                self.prefs
                    .write(&[(PrefKey::ServiceRunning, Value::from(true))])?;
                let interval = self.prefs.schedule_config().interval_minutes;
                if interval > 0 {
                    self.arm(interval, &now)?;
                }
            }
            ControlMessage::Stop => self.disarm()?,
            ControlMessage::SetQuietWindow(window) => self.prefs.save_quiet_window(&window)?,
            ControlMessage::SetVoice(voice) => {
                let defaults = VoiceSettings::default();
                let language = if voice.language.trim().is_empty() {
                    defaults.language
                } else {
                    voice.language.trim().to_string()
                };
                self.prefs.write(&[
                    (PrefKey::Language, Value::from(language)),
                    (PrefKey::Volume, Value::from(f64::from(voice.volume.clamp(0.0, 1.0)))),
                    (PrefKey::Rate, Value::from(f64::from(voice.rate.clamp(0.0, 1.0)))),
                ])?;
            }
            ControlMessage::SetRepeatCount(count) => {
                let count = count.clamp(MIN_REPEAT_COUNT, MAX_REPEAT_COUNT);
                self.prefs
                    .write(&[(PrefKey::RepeatCount, Value::from(count))])?;
            }
            ControlMessage::SetVibration(enabled) => {
                self.prefs
                    .write(&[(PrefKey::VibrationEnabled, Value::from(enabled))])?;
            }
            ControlMessage::SetClockFormat(use_24_hour) => {
                self.prefs.write(&[(
                    PrefKey::Use24HourFormat,
                    use_24_hour.map(Value::from).unwrap_or(Value::Null),
                )])?;
            }
            ControlMessage::AnnounceNow => {}
        }
        Ok(self.loop_state())
    }

    fn arm(&self, interval_minutes: u32, now: &DateTime<Local>) -> Result<()> {
        let next_ms = next_boundary(interval_minutes, now).timestamp_millis();
        self.prefs.write(&[
            (PrefKey::ServiceRunning, Value::from(true)),
            (PrefKey::NextAnnouncementTime, Value::from(next_ms)),
        ])?;
        self.alarm.schedule(interval_minutes)?;
        info!(
            "Armed: every {interval_minutes} min, next at {}",
            crate::utils::describe_ms(Some(next_ms))
        );
        Ok(())
    }

    fn disarm(&self) -> Result<()> {
        self.prefs.write(&[
            (PrefKey::ServiceRunning, Value::from(false)),
            (PrefKey::NextAnnouncementTime, Value::Null),
        ])?;
        self.alarm.cancel()?;
        info!("Disabled: scheduled announcements stopped");
        Ok(())
    }
}
