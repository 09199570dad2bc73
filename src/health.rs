use crate::config::{Config, get_config_path, load_config, save_config};
use crate::model::LoopState;
use crate::platform::{BackupAlarm, PersistedBackupAlarm};
use crate::service::{build_trigger, open_preferences};
use crate::store::Preferences;
use crate::survival::primary_alive;
use crate::trigger::{EnsureOutcome, TriggerSource};
use crate::utils::{describe_ms, ensure_dir, now_ms, secs_to_ms};
use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub id: String,
    pub label: String,
    pub level: CheckLevel,
    pub detail: String,
    pub fix_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub ok: usize,
    pub warn: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: String,
    pub checks: Vec<HealthCheck>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn check(&self, id: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorResult {
    pub report: HealthReport,
    pub changed: bool,
    pub actions: Vec<String>,
}

fn count_summary(checks: &[HealthCheck]) -> HealthSummary {
    let mut summary = HealthSummary {
        ok: 0,
        warn: 0,
        fail: 0,
    };
    for check in checks {
        match check.level {
            CheckLevel::Ok => summary.ok += 1,
            CheckLevel::Warn => summary.warn += 1,
            CheckLevel::Fail => summary.fail += 1,
        }
    }
    summary
}

fn check(id: &str, label: &str, level: CheckLevel, detail: String, fix_hint: Option<&str>) -> HealthCheck {
    HealthCheck {
        id: id.to_string(),
        label: label.to_string(),
        level,
        detail,
        fix_hint: match level {
            CheckLevel::Ok => None,
            _ => fix_hint.map(str::to_string),
        },
    }
}

fn prefs_file_check(prefs_path: &Path) -> HealthCheck {
    let label = "Preferences file";
    let detail = prefs_path.display().to_string();
    match std::fs::read_to_string(prefs_path) {
        Err(_) => check(
            "prefs.file",
            label,
            CheckLevel::Warn,
            format!("{detail} (missing, defaults in use)"),
            Some("Run `speaking-clock doctor --fix` or `speaking-clock set interval 15`."),
        ),
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) if value.is_object() => check("prefs.file", label, CheckLevel::Ok, detail, None),
            _ => check(
                "prefs.file",
                label,
                CheckLevel::Fail,
                format!("{detail} (unreadable, defaults in use)"),
                Some("Delete the file and reconfigure with `speaking-clock set ...`."),
            ),
        },
    }
}

fn speech_check(config: &Config) -> HealthCheck {
    let command = config.speech.command.trim();
    let label = "Speech backend";
    if command.is_empty() || command.eq_ignore_ascii_case("log") {
        return check(
            "speech.backend",
            label,
            CheckLevel::Warn,
            "log only (nothing is spoken aloud)".to_string(),
            Some("Set speech.command in config.json, e.g. espeak-ng."),
        );
    }
    match which::which(command) {
        Ok(path) => check("speech.backend", label, CheckLevel::Ok, path.display().to_string(), None),
        Err(_) => check(
            "speech.backend",
            label,
            CheckLevel::Fail,
            format!("{command} not found on PATH"),
            Some("Install espeak-ng or point speech.command at another TTS program."),
        ),
    }
}

pub fn collect_health(
    config: &Config,
    config_path: &Path,
    prefs_path: &Path,
    prefs: &Preferences,
    now_ms: i64,
) -> HealthReport {
    prefs.reload();
    let schedule = prefs.schedule_config();
    let state = prefs.schedule_state();
    let loop_state = LoopState::of(&schedule, &state);
    let armed = loop_state == LoopState::Armed;
    let tolerance_ms = (i64::from(schedule.interval_minutes) * 60_000)
        .saturating_add(secs_to_ms(config.runtime.health_grace_secs));

    let (next_level, next_detail) = match (armed, state.next_announcement_ms) {
        (false, _) => (CheckLevel::Ok, "not scheduled".to_string()),
        (true, None) => (CheckLevel::Fail, "missing".to_string()),
        (true, Some(next)) if now_ms.saturating_sub(next) > tolerance_ms => {
            (CheckLevel::Fail, format!("{} (stale)", describe_ms(Some(next))))
        }
        (true, Some(next)) if next.saturating_sub(now_ms) > tolerance_ms => {
            (CheckLevel::Warn, format!("{} (too far ahead)", describe_ms(Some(next))))
        }
        (true, Some(next)) => (CheckLevel::Ok, describe_ms(Some(next))),
    };

    let alive = primary_alive(
        state.last_heartbeat_ms,
        now_ms,
        config.runtime.liveness_window_ms(),
    );
    let backup = prefs.backup_alarm();
    let backup_level = match (armed, backup) {
        (true, Some(minutes)) if minutes == schedule.interval_minutes => CheckLevel::Ok,
        (false, None) => CheckLevel::Ok,
        _ => CheckLevel::Warn,
    };

    let checks = vec![
        check(
            "config.file",
            "Config file",
            if config_path.exists() {
                CheckLevel::Ok
            } else {
                CheckLevel::Warn
            },
            config_path.display().to_string(),
            Some("Run `speaking-clock init`."),
        ),
        prefs_file_check(prefs_path),
        check(
            "schedule.state",
            "Schedule",
            if armed { CheckLevel::Ok } else { CheckLevel::Warn },
            if armed {
                format!("{loop_state}, every {} min", schedule.interval_minutes)
            } else {
                loop_state.to_string()
            },
            Some("Run `speaking-clock set interval 15` or `speaking-clock start`."),
        ),
        check(
            "schedule.next",
            "Next announcement",
            next_level,
            next_detail,
            Some("Run `speaking-clock doctor --fix`."),
        ),
        check(
            "loop.heartbeat",
            "Primary loop heartbeat",
            if alive || !armed {
                CheckLevel::Ok
            } else {
                CheckLevel::Warn
            },
            describe_ms(state.last_heartbeat_ms),
            Some("Start the primary loop with `speaking-clock run`."),
        ),
        check(
            "alarm.backup",
            "Backup alarm",
            backup_level,
            match backup {
                Some(minutes) => format!("armed, every {minutes} min"),
                None => "not armed".to_string(),
            },
            Some("Run `speaking-clock doctor --fix`."),
        ),
        speech_check(config),
    ];
    HealthReport {
        generated_at: Local::now().to_rfc3339(),
        summary: count_summary(&checks),
        checks,
    }
}

pub async fn run_doctor(apply_fix: bool) -> Result<DoctorResult> {
    let config_path = get_config_path()?;
    let config = load_config(Some(&config_path)).unwrap_or_default();
    let prefs_path = config.prefs_path()?;
    let prefs = open_preferences(&config)?;
    let mut actions = Vec::new();

    if apply_fix {
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                ensure_dir(parent)?;
            }
            save_config(&config, Some(&config_path))?;
            actions.push(format!("created {}", config_path.display()));
        }
        if !prefs_path.exists() {
            if let Some(parent) = prefs_path.parent() {
                ensure_dir(parent)?;
            }
            std::fs::write(&prefs_path, "{}\n")?;
            actions.push(format!("created {}", prefs_path.display()));
        }

        let trigger = build_trigger(&config, prefs.clone())?;
        match trigger
            .ensure_armed(Local::now(), TriggerSource::HealthCheck)
            .await
        {
            EnsureOutcome::Rescheduled { next_ms, .. } => {
                actions.push(format!("rescheduled next announcement to {}", describe_ms(Some(next_ms))));
            }
            EnsureOutcome::Disabled if prefs.backup_alarm().is_some() => {
                PersistedBackupAlarm::new(prefs.clone()).cancel()?;
                actions.push("cancelled stale backup alarm".to_string());
            }
            EnsureOutcome::Disabled | EnsureOutcome::Armed { .. } => {}
        }
    }

    let report = collect_health(&config, &config_path, &prefs_path, &prefs, now_ms());
    Ok(DoctorResult {
        report,
        changed: !actions.is_empty(),
        actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PrefKey;
    use serde_json::Value;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn missing_path() -> PathBuf {
        std::env::temp_dir().join(format!("speaking-clock-missing-{}.json", Uuid::new_v4()))
    }

    fn log_only_config() -> Config {
        let mut config = Config::default();
        config.speech.command = "log".to_string();
        config
    }

    #[test]
    fn fresh_install_reports_warnings_not_failures() {
        let prefs = Preferences::in_memory();
        let report = collect_health(&log_only_config(), &missing_path(), &missing_path(), &prefs, 0);
        assert_eq!(report.summary.fail, 0);
        assert_eq!(report.check("schedule.state").map(|c| c.level), Some(CheckLevel::Warn));
        assert_eq!(report.check("schedule.next").map(|c| c.level), Some(CheckLevel::Ok));
        assert!(report.check("config.file").and_then(|c| c.fix_hint.clone()).is_some());
    }

    #[test]
    fn stale_schedule_is_a_failure() -> Result<()> {
        let prefs = Preferences::in_memory();
        let now = 100 * 60 * 60_000;
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(15)),
            (PrefKey::ServiceRunning, Value::from(true)),
            (PrefKey::NextAnnouncementTime, Value::from(now - 40 * 60_000)),
            (PrefKey::LastHeartbeat, Value::from(now - 30_000)),
            (PrefKey::BackupAlarmArmed, Value::from(true)),
            (PrefKey::BackupAlarmIntervalMinutes, Value::from(15)),
        ])?;
        let report = collect_health(&log_only_config(), &missing_path(), &missing_path(), &prefs, now);
        assert_eq!(report.check("schedule.next").map(|c| c.level), Some(CheckLevel::Fail));
        assert_eq!(report.check("loop.heartbeat").map(|c| c.level), Some(CheckLevel::Ok));
        assert_eq!(report.check("alarm.backup").map(|c| c.level), Some(CheckLevel::Ok));
        assert_eq!(report.summary.fail, 1);
        Ok(())
    }

    #[test]
    fn dead_primary_and_lost_alarm_are_flagged() -> Result<()> {
        let prefs = Preferences::in_memory();
        let now = 100 * 60 * 60_000;
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(30)),
            (PrefKey::ServiceRunning, Value::from(true)),
            (PrefKey::NextAnnouncementTime, Value::from(now + 60_000)),
            (PrefKey::LastHeartbeat, Value::from(now - 3_600_000)),
        ])?;
        let report = collect_health(&log_only_config(), &missing_path(), &missing_path(), &prefs, now);
        assert_eq!(report.check("schedule.next").map(|c| c.level), Some(CheckLevel::Ok));
        assert_eq!(report.check("loop.heartbeat").map(|c| c.level), Some(CheckLevel::Warn));
        assert_eq!(report.check("alarm.backup").map(|c| c.level), Some(CheckLevel::Warn));
        Ok(())
    }

    #[test]
    fn corrupt_prefs_file_fails() -> Result<()> {
        let path = missing_path();
        std::fs::write(&path, "not json")?;
        assert_eq!(prefs_file_check(&path).level, CheckLevel::Fail);
        std::fs::write(&path, "{\"intervalMinutes\": 15}")?;
        assert_eq!(prefs_file_check(&path).level, CheckLevel::Ok);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn missing_speech_program_fails() {
        let mut config = Config::default();
        config.speech.command = format!("no-such-tts-{}", Uuid::new_v4());
        assert_eq!(speech_check(&config).level, CheckLevel::Fail);
        assert_eq!(speech_check(&log_only_config()).level, CheckLevel::Warn);
    }
}
