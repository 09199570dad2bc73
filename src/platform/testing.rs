//! Recording fakes for the platform traits.

use crate::model::VoiceSettings;
use crate::platform::{BackupAlarm, Notifier, SpeechEngine, Vibrator};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct RecordingSpeech {
    pub spoken: Mutex<Vec<(String, String)>>,
    /// Languages that fail with an "unsupported" error.
    pub unsupported: Vec<String>,
}

impl RecordingSpeech {
    pub fn rejecting(languages: &[&str]) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            unsupported: languages.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    pub fn languages(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|(_, lang)| lang.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.spoken.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechEngine for RecordingSpeech {
    fn name(&self) -> &str {
        "recording"
    }

    async fn speak(&self, text: &str, voice: &VoiceSettings) -> Result<()> {
        if self.unsupported.iter().any(|l| l == &voice.language) {
            return Err(anyhow!("language {} not supported", voice.language));
        }
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), voice.language.clone()));
        Ok(())
    }
}

pub struct RecordingVibrator {
    pub present: bool,
    pub pulses: Mutex<Vec<Duration>>,
}

impl RecordingVibrator {
    pub fn new(present: bool) -> Self {
        Self {
            present,
            pulses: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.pulses.lock().unwrap().len()
    }
}

impl Vibrator for RecordingVibrator {
    fn has_vibrator(&self) -> bool {
        self.present
    }

    fn vibrate(&self, duration: Duration) -> Result<()> {
        self.pulses.lock().unwrap().push(duration);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub contents: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn last_body(&self) -> Option<String> {
        self.contents.lock().unwrap().last().map(|(_, body)| body.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn set_foreground_content(&self, title: &str, body: &str) -> Result<()> {
        self.contents
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlarm {
    pub scheduled: Mutex<Option<u32>>,
    pub cancels: Mutex<usize>,
}

impl RecordingAlarm {
    pub fn current(&self) -> Option<u32> {
        *self.scheduled.lock().unwrap()
    }

    pub fn cancel_count(&self) -> usize {
        *self.cancels.lock().unwrap()
    }
}

impl BackupAlarm for RecordingAlarm {
    fn schedule(&self, interval_minutes: u32) -> Result<()> {
        *self.scheduled.lock().unwrap() = Some(interval_minutes);
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        *self.scheduled.lock().unwrap() = None;
        *self.cancels.lock().unwrap() += 1;
        Ok(())
    }
}
