use crate::platform::{BackupAlarm, Vibrator};
use crate::store::{PrefKey, Preferences};
use anyhow::Result;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Desktop hosts have no vibration motor.
pub struct NoVibrator;

impl Vibrator for NoVibrator {
    fn has_vibrator(&self) -> bool {
        false
    }

    fn vibrate(&self, _duration: Duration) -> Result<()> {
        Ok(())
    }
}

/// Records the backup alarm registration in the preferences.
///
/// The host's own periodic timer (systemd timer, cron, launchd) invokes
/// `speaking-clock alarm`. That command decides from the schedule state and
/// the primary lock alone; the registration is what `status` reports as the
/// period to configure the timer with, and `alarm` clears it once the
/// schedule is disabled.
pub struct PersistedBackupAlarm {
    prefs: Preferences,
}

impl PersistedBackupAlarm {
    pub fn new(prefs: Preferences) -> Self {
        Self { prefs }
    }
}

impl BackupAlarm for PersistedBackupAlarm {
    fn schedule(&self, interval_minutes: u32) -> Result<()> {
        debug!("Backup alarm armed every {interval_minutes} min");
        self.prefs.write(&[
            (PrefKey::BackupAlarmArmed, Value::from(true)),
            (PrefKey::BackupAlarmIntervalMinutes, Value::from(interval_minutes)),
        ])
    }

    fn cancel(&self) -> Result<()> {
        debug!("Backup alarm cancelled");
        self.prefs.write(&[
            (PrefKey::BackupAlarmArmed, Value::from(false)),
            (PrefKey::BackupAlarmIntervalMinutes, Value::Null),
        ])
    }
}
