//! Capabilities the scheduling core drives but does not implement.

pub mod device;
pub mod notify;
pub mod speech;
#[cfg(test)]
pub mod testing;

use crate::model::VoiceSettings;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use device::{NoVibrator, PersistedBackupAlarm};
pub use notify::{StatusFileNotifier, build_notifier};
pub use speech::{CommandSpeech, LogSpeech, build_speech};

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// True when `speak` only resolves after the utterance has finished.
    fn awaits_completion(&self) -> bool {
        false
    }

    async fn speak(&self, text: &str, voice: &VoiceSettings) -> Result<()>;
}

pub trait Vibrator: Send + Sync {
    fn has_vibrator(&self) -> bool;
    fn vibrate(&self, duration: Duration) -> Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn set_foreground_content(&self, title: &str, body: &str) -> Result<()>;
}

/// Coarse wake-capable timer that restarts the primary loop if it died.
pub trait BackupAlarm: Send + Sync {
    fn schedule(&self, interval_minutes: u32) -> Result<()>;
    fn cancel(&self) -> Result<()>;
}
