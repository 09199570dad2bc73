//! Decisions made by the out-of-process recovery sources: the boot hook
//! and the backup alarm. Neither ever speaks; both only decide whether the
//! primary loop needs to be (re)launched.
//!
//! [`PrimaryLock`] keeps that decision honest: at most one `run` process
//! holds it, and a held lock means a primary exists even if its heartbeat
//! is late.

use crate::model::LoopState;
use crate::store::{PrefKey, Preferences};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Exclusive host-wide claim held by the running primary loop. The OS
/// releases it when the process exits, so a crash never leaves it stale.
#[derive(Debug)]
pub struct PrimaryLock {
    _file: File,
    path: PathBuf,
}

impl PrimaryLock {
    /// Claims the lock, or returns `None` when another primary holds it.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = open_lock_file(path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(err)) => {
                return Err(err).with_context(|| format!("failed to lock {}", path.display()));
            }
        }
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Primary lock acquired at {}", path.display());
        Ok(Some(Self {
            _file: file,
            path: path.to_path_buf(),
        }))
    }

    /// True while some process holds the lock at `path`.
    pub fn is_held(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let file = open_lock_file(path)?;
        match file.try_lock() {
            Ok(()) => Ok(false),
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(err)) => {
                Err(err).with_context(|| format!("failed to check {}", path.display()))
            }
        }
    }

    /// Pid recorded by the current holder. Unreadable on hosts with
    /// mandatory locking, where this returns `None`.
    pub fn holder_pid(path: &Path) -> Option<u32> {
        let mut raw = String::new();
        File::open(path).ok()?.read_to_string(&mut raw).ok()?;
        raw.trim().parse().ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootEvent {
    BootCompleted,
    PackageReplaced,
    QuickBoot,
}

impl FromStr for BootEvent {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "boot" | "boot-completed" => Ok(Self::BootCompleted),
            "package-replaced" | "upgrade" => Ok(Self::PackageReplaced),
            "quick-boot" | "resume" => Ok(Self::QuickBoot),
            other => Err(format!("unknown boot event '{other}'")),
        }
    }
}

impl std::fmt::Display for BootEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BootCompleted => write!(f, "boot-completed"),
            Self::PackageReplaced => write!(f, "package-replaced"),
            Self::QuickBoot => write!(f, "quick-boot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    Relaunch,
    Ignore,
}

/// Boot hook: relaunch the primary loop only if the user left it armed.
pub fn on_boot(prefs: &Preferences, event: BootEvent, now_ms: i64) -> Result<BootAction> {
    prefs.reload();
    let state = LoopState::of(&prefs.schedule_config(), &prefs.schedule_state());
    if state == LoopState::Disabled {
        debug!("Ignoring {event}: schedule disabled");
        return Ok(BootAction::Ignore);
    }
    prefs.write(&[
        (PrefKey::BootCompleted, Value::from(true)),
        (PrefKey::BootCompletedAt, Value::from(now_ms)),
    ])?;
    info!("Received {event}, relaunching primary loop");
    Ok(BootAction::Relaunch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupAlarmAction {
    /// Schedule is off; the registration is stale.
    Disarmed,
    PrimaryAlive,
    Restart,
}

/// A primary loop is alive when its last heartbeat is within `window_ms`.
pub fn primary_alive(last_heartbeat_ms: Option<i64>, now_ms: i64, window_ms: i64) -> bool {
    last_heartbeat_ms.is_some_and(|hb| {
        now_ms.saturating_sub(hb) <= window_ms && hb.saturating_sub(now_ms) <= window_ms
    })
}

/// Dead-man's switch: decide what a backup alarm firing should do.
///
/// `primary_running` is whether a primary holds the [`PrimaryLock`]. A held
/// lock with a stale heartbeat is a wedged primary; starting a second one
/// would double the announcements, so it is only reported.
pub fn backup_alarm_decision(
    prefs: &Preferences,
    now_ms: i64,
    window_ms: i64,
    primary_running: bool,
) -> BackupAlarmAction {
    prefs.reload();
    let state = prefs.schedule_state();
    if LoopState::of(&prefs.schedule_config(), &state) == LoopState::Disabled {
        return BackupAlarmAction::Disarmed;
    }
    let fresh = primary_alive(state.last_heartbeat_ms, now_ms, window_ms);
    if primary_running {
        if !fresh {
            warn!(
                "Backup alarm: primary holds the lock but its heartbeat is stale ({})",
                crate::utils::describe_ms(state.last_heartbeat_ms)
            );
        }
        BackupAlarmAction::PrimaryAlive
    } else if fresh {
        info!("Backup alarm: heartbeat is fresh but no primary holds the lock, restart needed");
        BackupAlarmAction::Restart
    } else {
        info!(
            "Backup alarm: primary heartbeat stale ({}), restart needed",
            crate::utils::describe_ms(state.last_heartbeat_ms)
        );
        BackupAlarmAction::Restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn armed_prefs() -> Result<Preferences> {
        let prefs = Preferences::in_memory();
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(15)),
            (PrefKey::ServiceRunning, Value::from(true)),
        ])?;
        Ok(prefs)
    }

    #[test]
    fn boot_relaunches_only_when_armed() -> Result<()> {
        let prefs = armed_prefs()?;
        assert_eq!(
            on_boot(&prefs, BootEvent::BootCompleted, 1_000)?,
            BootAction::Relaunch
        );
        assert_eq!(prefs.boot_completed_at(), Some(1_000));

        let idle = Preferences::in_memory();
        assert_eq!(on_boot(&idle, BootEvent::QuickBoot, 1_000)?, BootAction::Ignore);
        assert_eq!(idle.boot_completed_at(), None);
        Ok(())
    }

    #[test]
    fn boot_ignored_after_user_stop() -> Result<()> {
        let prefs = armed_prefs()?;
        prefs.write(&[(PrefKey::ServiceRunning, Value::from(false))])?;
        assert_eq!(
            on_boot(&prefs, BootEvent::PackageReplaced, 1_000)?,
            BootAction::Ignore
        );
        Ok(())
    }

    #[test]
    fn backup_alarm_restarts_when_no_primary_holds_the_lock() -> Result<()> {
        let prefs = armed_prefs()?;
        let window = 360_000;
        let now = 10_000_000;
        assert_eq!(
            backup_alarm_decision(&prefs, now, window, false),
            BackupAlarmAction::Restart
        );

        // A fresh heartbeat left by a process that has since exited.
        prefs.record_heartbeat(now - 60_000)?;
        assert_eq!(
            backup_alarm_decision(&prefs, now, window, false),
            BackupAlarmAction::Restart
        );
        assert_eq!(
            backup_alarm_decision(&prefs, now, window, true),
            BackupAlarmAction::PrimaryAlive
        );
        Ok(())
    }

    #[test]
    fn backup_alarm_never_starts_a_second_primary() -> Result<()> {
        let prefs = armed_prefs()?;
        let window = 360_000;
        let now = 10_000_000;
        prefs.record_heartbeat(now - window - 1)?;
        assert_eq!(
            backup_alarm_decision(&prefs, now, window, true),
            BackupAlarmAction::PrimaryAlive
        );
        Ok(())
    }

    #[test]
    fn backup_alarm_is_inert_when_disabled() -> Result<()> {
        let prefs = Preferences::in_memory();
        assert_eq!(
            backup_alarm_decision(&prefs, 0, 360_000, false),
            BackupAlarmAction::Disarmed
        );

        // A leftover registration does not revive a stopped schedule.
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(15)),
            (PrefKey::BackupAlarmArmed, Value::from(true)),
            (PrefKey::BackupAlarmIntervalMinutes, Value::from(15)),
        ])?;
        assert_eq!(prefs.backup_alarm(), Some(15));
        assert_eq!(
            backup_alarm_decision(&prefs, 0, 360_000, false),
            BackupAlarmAction::Disarmed
        );
        Ok(())
    }

    #[test]
    fn backup_alarm_decides_from_state_without_a_registration() -> Result<()> {
        let prefs = armed_prefs()?;
        assert_eq!(prefs.backup_alarm(), None);
        assert_eq!(
            backup_alarm_decision(&prefs, 10_000_000, 360_000, false),
            BackupAlarmAction::Restart
        );
        Ok(())
    }

    #[test]
    fn primary_lock_admits_a_single_holder() -> Result<()> {
        let path = std::env::temp_dir().join(format!("speaking-clock-primary-{}.lock", Uuid::new_v4()));
        assert!(!PrimaryLock::is_held(&path)?);

        let held = PrimaryLock::acquire(&path)?;
        assert!(held.is_some());
        assert!(PrimaryLock::is_held(&path)?);
        assert!(PrimaryLock::acquire(&path)?.is_none());
        assert_eq!(PrimaryLock::holder_pid(&path), Some(std::process::id()));

        drop(held);
        assert!(!PrimaryLock::is_held(&path)?);
        let again = PrimaryLock::acquire(&path)?;
        assert!(again.is_some());
        drop(again);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn heartbeat_from_the_future_is_not_alive() {
        assert!(!primary_alive(Some(10_000_000), 0, 360_000));
        assert!(primary_alive(Some(100), 0, 360_000));
        assert!(!primary_alive(None, 0, 360_000));
    }

    #[test]
    fn boot_events_parse() {
        assert_eq!("boot-completed".parse::<BootEvent>(), Ok(BootEvent::BootCompleted));
        assert_eq!("PACKAGE_REPLACED".parse::<BootEvent>(), Ok(BootEvent::PackageReplaced));
        assert_eq!("quick-boot".parse::<BootEvent>(), Ok(BootEvent::QuickBoot));
        assert!("shutdown".parse::<BootEvent>().is_err());
    }
}
